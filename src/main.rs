mod api;
mod profile;
mod similarity;

use anyhow::Result;
use api::App;
use dotenv::dotenv;
use env_logger::Builder;
use lazy_static::lazy_static;
use log::LevelFilter;
use profile::embedder::OpenAiEmbedder;
use similarity::engine::SimilarityEngine;
use similarity::storage::Storage;
use std::str::FromStr;
use std::sync::Arc;
use tiktoken_rs::cl100k_base;

#[macro_use]
extern crate log;

lazy_static! {
    static ref PORT: u16 = env_or("PORT", 8080);
    static ref STORAGE_DIR: String =
        std::env::var("STORAGE_DIR").unwrap_or_else(|_| "./storage".to_string());
    static ref EMBEDDING_MODEL: String = std::env::var("EMBEDDING_MODEL")
        .unwrap_or_else(|_| "text-embedding-ada-002".to_string());
    static ref EMBEDDING_DIMENSIONS: usize = env_or("EMBEDDING_DIMENSIONS", 1536);
    static ref EMBEDDING_MAX_TOKENS: usize = env_or("EMBEDDING_MAX_TOKENS", 8000);
}

fn env_or<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().unwrap_or_else(|_| {
            warn!("{}={} is not valid, use {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // read .env
    dotenv().ok();

    // init logger
    let log_level = std::env::var("RUST_LOG").unwrap_or_default();

    if log_level == "debug" {
        Builder::new()
            .filter(None, LevelFilter::Off)
            .filter(Some("eventmatch::similarity"), LevelFilter::Debug)
            .filter(Some("eventmatch"), LevelFilter::Debug)
            .init();
    } else if log_level == "info" {
        Builder::new()
            .filter(None, LevelFilter::Off)
            .filter(Some("eventmatch::similarity"), LevelFilter::Info)
            .filter(Some("eventmatch"), LevelFilter::Info)
            .init();
    } else {
        env_logger::init();
    }

    // check dependencies
    cl100k_base()?;
    let storage = Storage::new(&STORAGE_DIR)?;
    info!(
        "dependencies check succeed, storage: {}, model: {}, dimensions: {}",
        *STORAGE_DIR, *EMBEDDING_MODEL, *EMBEDDING_DIMENSIONS
    );

    let shared = Arc::new(storage.clone());
    let app = Arc::new(App {
        engine: SimilarityEngine::new(shared.clone(), shared, *EMBEDDING_DIMENSIONS),
        storage,
        embedder: Arc::new(OpenAiEmbedder::new(EMBEDDING_MODEL.clone())),
        dimensions: *EMBEDDING_DIMENSIONS,
        max_tokens: *EMBEDDING_MAX_TOKENS,
    });

    info!("server running at port: {}", *PORT);
    warp::serve(api::routes(app))
        .run(([0, 0, 0, 0], *PORT))
        .await;

    Ok(())
}
