use super::error::{Result, SimilarityError};
use super::matching::{cosine_similarity, rank, Scored, SimilarityRecord};
use crate::profile::ProfileCard;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

/// Stored embedding of a profile as the profile store sees it.
#[derive(Clone, Debug, PartialEq)]
pub enum Embedding {
    Absent,
    Vector(Vec<f32>),
    /// Bytes exist but could not be decoded into a vector.
    Unreadable(String),
}

#[derive(Clone, Debug)]
pub struct ProfileEmbedding {
    pub id: String,
    pub embedding: Embedding,
}

#[derive(Clone, Debug)]
pub struct Member {
    pub id: String,
    pub card: ProfileCard,
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Every profile of the event that has something stored as its embedding.
    async fn embedded_profiles(&self, event_id: &str) -> anyhow::Result<Vec<ProfileEmbedding>>;
    async fn members(&self, event_id: &str) -> anyhow::Result<Vec<Member>>;
}

#[async_trait]
pub trait SimilarityStore: Send + Sync {
    /// Writes all records in one go, overwriting rows with the same pair.
    async fn upsert(&self, event_id: &str, records: Vec<SimilarityRecord>) -> anyhow::Result<()>;
    /// Rows where `profile_id` is on either side of the pair.
    async fn similarities_for(
        &self,
        event_id: &str,
        profile_id: &str,
    ) -> anyhow::Result<Vec<SimilarityRecord>>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub scores_calculated: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct SimilarityEngine {
    profiles: Arc<dyn ProfileStore>,
    similarities: Arc<dyn SimilarityStore>,
    dimensions: usize,
}

impl SimilarityEngine {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        similarities: Arc<dyn SimilarityStore>,
        dimensions: usize,
    ) -> Self {
        Self {
            profiles,
            similarities,
            dimensions,
        }
    }

    /// Scores `target_profile_id` against every other embedded profile of the event.
    pub async fn recompute_for_profile(
        &self,
        event_id: &str,
        target_profile_id: &str,
    ) -> Result<Outcome> {
        require(event_id, "event id is empty")?;
        require(target_profile_id, "profile id is empty")?;

        let start = Instant::now();
        let snapshot = self.snapshot(event_id).await?;
        let target = snapshot
            .vectors
            .iter()
            .find(|(id, _)| id == target_profile_id)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| SimilarityError::MissingEmbedding {
                event_id: event_id.to_string(),
                profile_id: target_profile_id.to_string(),
            })?;

        let mut staged = BTreeMap::new();
        for (id, vector) in snapshot.vectors.iter() {
            if id == target_profile_id {
                continue;
            }
            let record = SimilarityRecord::new(
                event_id,
                target_profile_id,
                id,
                cosine_similarity(&target, vector),
            );
            staged.insert(
                (record.profile_id_1.clone(), record.profile_id_2.clone()),
                record,
            );
        }

        let outcome = self.persist(event_id, staged, snapshot.skipped).await?;
        let elapsed = start.elapsed().as_secs_f64();
        info!(
            "recompute event: {} profile: {} scores: {} skipped: {} spends {}s",
            event_id, target_profile_id, outcome.scores_calculated, outcome.skipped, elapsed
        );
        Ok(outcome)
    }

    /// Scores every unordered pair of embedded profiles in the event.
    pub async fn recompute_for_event(&self, event_id: &str) -> Result<Outcome> {
        require(event_id, "event id is empty")?;

        let start = Instant::now();
        let snapshot = self.snapshot(event_id).await?;
        let vectors = &snapshot.vectors;

        let mut staged = BTreeMap::new();
        for i in 0..vectors.len() {
            for j in (i + 1)..vectors.len() {
                let (a, va) = &vectors[i];
                let (b, vb) = &vectors[j];
                let record = SimilarityRecord::new(event_id, a, b, cosine_similarity(va, vb));
                staged.insert(
                    (record.profile_id_1.clone(), record.profile_id_2.clone()),
                    record,
                );
            }
        }

        let outcome = self.persist(event_id, staged, snapshot.skipped).await?;
        let elapsed = start.elapsed().as_secs_f64();
        info!(
            "recompute event: {} profiles: {} scores: {} skipped: {} spends {}s",
            event_id,
            vectors.len(),
            outcome.scores_calculated,
            outcome.skipped,
            elapsed
        );
        Ok(outcome)
    }

    /// Other members of the event ranked by stored similarity to `profile_id`.
    /// Pairs without a stored row score `0.0`. A `profile_id` that is not a
    /// member of the event gets an empty list. Never writes.
    pub async fn connections(
        &self,
        event_id: &str,
        profile_id: &str,
    ) -> Result<Vec<Scored<ProfileCard>>> {
        require(event_id, "event id is empty")?;
        require(profile_id, "profile id is empty")?;

        let (members, rows) = futures::try_join!(
            self.profiles.members(event_id),
            self.similarities.similarities_for(event_id, profile_id)
        )
        .map_err(SimilarityError::UpstreamRead)?;

        let scores = rows
            .iter()
            .filter(|r| r.profile_id_1 != r.profile_id_2)
            .filter_map(|r| r.counterpart(profile_id).map(|c| (c, r.similarity_score)))
            .collect::<HashMap<_, _>>();

        if !members.iter().any(|m| m.id == profile_id) {
            debug!("profile: {} is not a member of event: {}", profile_id, event_id);
            return Ok(vec![]);
        }

        let mut seen = std::collections::HashSet::new();
        let mut scored = members
            .into_iter()
            .filter(|m| m.id != profile_id && seen.insert(m.id.clone()))
            .map(|m| Scored {
                similarity_score: scores.get(m.id.as_str()).copied().unwrap_or(0.0),
                profile_id: m.id,
                item: m.card,
            })
            .collect::<Vec<_>>();
        rank(&mut scored);
        debug!(
            "connections event: {} profile: {} members: {} stored: {}",
            event_id,
            profile_id,
            scored.len(),
            scores.len()
        );
        Ok(scored)
    }

    /// One read of the event's embeddings, sorted by id, unusable vectors dropped.
    async fn snapshot(&self, event_id: &str) -> Result<Snapshot> {
        let mut fetched = self.profiles.embedded_profiles(event_id).await.map_err(|e| {
            warn!("read profiles of event: {} failed: {}", event_id, e);
            SimilarityError::UpstreamRead(e)
        })?;
        fetched.sort_by(|a, b| a.id.cmp(&b.id));
        fetched.dedup_by(|a, b| a.id == b.id);

        let mut snapshot = Snapshot::default();
        for profile in fetched {
            match self.usable(profile.embedding) {
                Ok(vector) => snapshot.vectors.push((profile.id, vector)),
                Err(reason) => {
                    debug!("skip profile: {} of event: {}: {}", profile.id, event_id, reason);
                    snapshot.skipped += 1;
                }
            }
        }
        Ok(snapshot)
    }

    fn usable(&self, embedding: Embedding) -> std::result::Result<Vec<f32>, String> {
        match embedding {
            Embedding::Absent => Err("no embedding".to_string()),
            Embedding::Unreadable(reason) => Err(reason),
            Embedding::Vector(v) if v.len() != self.dimensions => Err(format!(
                "dimension {} does not match {}",
                v.len(),
                self.dimensions
            )),
            Embedding::Vector(v) if v.iter().any(|x| !x.is_finite()) => {
                Err("non-finite component".to_string())
            }
            Embedding::Vector(v) => Ok(v),
        }
    }

    async fn persist(
        &self,
        event_id: &str,
        staged: BTreeMap<(String, String), SimilarityRecord>,
        skipped: usize,
    ) -> Result<Outcome> {
        let records = staged
            .into_values()
            .filter(|r| r.profile_id_1 != r.profile_id_2)
            .collect::<Vec<_>>();
        let scores_calculated = records.len();
        if scores_calculated == 0 {
            info!("event: {} has nothing to compute", event_id);
            return Ok(Outcome {
                scores_calculated,
                skipped,
            });
        }

        self.similarities
            .upsert(event_id, records)
            .await
            .map_err(|e| {
                warn!("upsert similarities of event: {} failed: {}", event_id, e);
                SimilarityError::UpstreamWrite(e)
            })?;
        Ok(Outcome {
            scores_calculated,
            skipped,
        })
    }
}

#[derive(Default)]
struct Snapshot {
    vectors: Vec<(String, Vec<f32>)>,
    skipped: usize,
}

fn require(value: &str, message: &'static str) -> Result<()> {
    if value.is_empty() {
        return Err(SimilarityError::InvalidInput(message));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::sync::RwLock;

    /// In-memory stand-in for both stores.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub profiles: RwLock<BTreeMap<String, Vec<(String, Embedding)>>>,
        pub rows: RwLock<BTreeMap<(String, String, String), f64>>,
        pub upserts: RwLock<usize>,
        pub fail_reads: bool,
        pub fail_writes: bool,
    }

    impl MemoryStore {
        pub async fn put(&self, event_id: &str, id: &str, embedding: Embedding) {
            let mut profiles = self.profiles.write().await;
            let members = profiles.entry(event_id.to_string()).or_default();
            members.retain(|(m, _)| m != id);
            members.push((id.to_string(), embedding));
        }

        pub async fn rows(&self, event_id: &str) -> Vec<(String, String, f64)> {
            self.rows
                .read()
                .await
                .iter()
                .filter(|((e, _, _), _)| e == event_id)
                .map(|((_, a, b), s)| (a.clone(), b.clone(), *s))
                .collect()
        }
    }

    #[async_trait]
    impl ProfileStore for MemoryStore {
        async fn embedded_profiles(&self, event_id: &str) -> anyhow::Result<Vec<ProfileEmbedding>> {
            if self.fail_reads {
                anyhow::bail!("profile store unreachable");
            }
            Ok(self
                .profiles
                .read()
                .await
                .get(event_id)
                .map(|members| {
                    members
                        .iter()
                        .filter(|(_, e)| *e != Embedding::Absent)
                        .map(|(id, e)| ProfileEmbedding {
                            id: id.clone(),
                            embedding: e.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn members(&self, event_id: &str) -> anyhow::Result<Vec<Member>> {
            if self.fail_reads {
                anyhow::bail!("profile store unreachable");
            }
            Ok(self
                .profiles
                .read()
                .await
                .get(event_id)
                .map(|members| {
                    members
                        .iter()
                        .map(|(id, _)| Member {
                            id: id.clone(),
                            card: ProfileCard {
                                name: id.to_uppercase(),
                                ..Default::default()
                            },
                        })
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    #[async_trait]
    impl SimilarityStore for MemoryStore {
        async fn upsert(&self, event_id: &str, records: Vec<SimilarityRecord>) -> anyhow::Result<()> {
            if self.fail_writes {
                anyhow::bail!("similarity store rejected write");
            }
            let mut rows = self.rows.write().await;
            for r in records {
                rows.insert(
                    (event_id.to_string(), r.profile_id_1, r.profile_id_2),
                    r.similarity_score,
                );
            }
            *self.upserts.write().await += 1;
            Ok(())
        }

        async fn similarities_for(
            &self,
            event_id: &str,
            profile_id: &str,
        ) -> anyhow::Result<Vec<SimilarityRecord>> {
            if self.fail_reads {
                anyhow::bail!("similarity store unreachable");
            }
            Ok(self
                .rows
                .read()
                .await
                .iter()
                .filter(|((e, a, b), _)| e == event_id && (a == profile_id || b == profile_id))
                .map(|((e, a, b), s)| SimilarityRecord {
                    event_id: e.clone(),
                    profile_id_1: a.clone(),
                    profile_id_2: b.clone(),
                    similarity_score: *s,
                })
                .collect())
        }
    }

    fn engine(store: Arc<MemoryStore>) -> SimilarityEngine {
        SimilarityEngine::new(store.clone(), store, 2)
    }

    fn vector(v: &[f32]) -> Embedding {
        Embedding::Vector(v.to_vec())
    }

    fn row(a: &str, b: &str, s: f64) -> (String, String, f64) {
        (a.to_string(), b.to_string(), s)
    }

    #[tokio::test]
    async fn event_recompute_scores_every_pair() {
        let store = Arc::new(MemoryStore::default());
        store.put("ev", "P3", vector(&[1.0, 0.0])).await;
        store.put("ev", "P1", vector(&[1.0, 0.0])).await;
        store.put("ev", "P2", vector(&[0.0, 1.0])).await;

        let outcome = engine(store.clone()).recompute_for_event("ev").await.unwrap();
        assert_eq!(outcome.scores_calculated, 3);
        assert_eq!(
            store.rows("ev").await,
            vec![row("P1", "P2", 0.0), row("P1", "P3", 1.0), row("P2", "P3", 0.0)]
        );
    }

    #[tokio::test]
    async fn profile_without_embedding_is_rejected() {
        let store = Arc::new(MemoryStore::default());
        store.put("ev", "P1", vector(&[1.0, 0.0])).await;
        store.put("ev", "P4", Embedding::Absent).await;

        let err = engine(store.clone())
            .recompute_for_profile("ev", "P4")
            .await
            .unwrap_err();
        assert!(matches!(err, SimilarityError::MissingEmbedding { .. }));
        assert!(store.rows("ev").await.is_empty());
        assert_eq!(*store.upserts.read().await, 0);
    }

    #[tokio::test]
    async fn single_embedded_profile_computes_nothing() {
        let store = Arc::new(MemoryStore::default());
        store.put("ev", "P1", vector(&[1.0, 0.0])).await;
        store.put("ev", "P2", Embedding::Absent).await;

        let outcome = engine(store.clone()).recompute_for_event("ev").await.unwrap();
        assert_eq!(outcome.scores_calculated, 0);
        assert_eq!(*store.upserts.read().await, 0);

        let outcome = engine(store.clone()).recompute_for_event("empty").await.unwrap();
        assert_eq!(outcome.scores_calculated, 0);
    }

    #[tokio::test]
    async fn profile_recompute_covers_opposite_vectors() {
        let store = Arc::new(MemoryStore::default());
        store.put("ev", "P1", vector(&[3.0, 4.0])).await;
        store.put("ev", "P2", vector(&[3.0, 4.0])).await;
        store.put("ev", "P3", vector(&[-3.0, -4.0])).await;

        let outcome = engine(store.clone())
            .recompute_for_profile("ev", "P1")
            .await
            .unwrap();
        assert_eq!(outcome.scores_calculated, 2);
        let rows = store.rows("ev").await;
        assert_eq!(rows.len(), 2);
        assert!((rows[0].2 - 1.0).abs() < 1e-9);
        assert!((rows[1].2 + 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn changed_embedding_overwrites_existing_row() {
        let store = Arc::new(MemoryStore::default());
        store.put("ev", "P1", vector(&[1.0, 0.0])).await;
        store.put("ev", "P2", vector(&[0.0, 1.0])).await;
        store.put("ev", "P3", vector(&[1.0, 0.0])).await;
        let engine = engine(store.clone());
        engine.recompute_for_event("ev").await.unwrap();

        store.put("ev", "P2", vector(&[1.0, 0.0])).await;
        engine.recompute_for_event("ev").await.unwrap();

        let rows = store.rows("ev").await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], row("P1", "P2", 1.0));
        assert_eq!(rows[2], row("P2", "P3", 1.0));
    }

    #[tokio::test]
    async fn profile_recompute_is_idempotent_and_canonical() {
        let store = Arc::new(MemoryStore::default());
        store.put("ev", "zoe", vector(&[0.2, 0.9])).await;
        store.put("ev", "amy", vector(&[0.7, 0.1])).await;
        store.put("ev", "max", vector(&[0.5, 0.5])).await;
        let engine = engine(store.clone());

        engine.recompute_for_profile("ev", "zoe").await.unwrap();
        let first = store.rows("ev").await;
        engine.recompute_for_profile("ev", "zoe").await.unwrap();
        let second = store.rows("ev").await;

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        for (a, b, _) in first {
            assert!(a < b);
        }
    }

    #[tokio::test]
    async fn malformed_candidates_are_skipped() {
        let store = Arc::new(MemoryStore::default());
        store.put("ev", "P1", vector(&[1.0, 0.0])).await;
        store.put("ev", "P2", vector(&[1.0, 0.0, 0.0])).await;
        store.put("ev", "P3", Embedding::Unreadable("ragged bytes".to_string())).await;
        store.put("ev", "P4", vector(&[f32::NAN, 1.0])).await;
        store.put("ev", "P5", vector(&[0.0, 2.0])).await;

        let outcome = engine(store.clone())
            .recompute_for_profile("ev", "P1")
            .await
            .unwrap();
        assert_eq!(outcome, Outcome { scores_calculated: 1, skipped: 3 });
        assert_eq!(store.rows("ev").await, vec![row("P1", "P5", 0.0)]);
    }

    #[tokio::test]
    async fn malformed_target_counts_as_missing() {
        let store = Arc::new(MemoryStore::default());
        store.put("ev", "P1", vector(&[1.0])).await;
        store.put("ev", "P2", vector(&[1.0, 0.0])).await;

        let err = engine(store).recompute_for_profile("ev", "P1").await.unwrap_err();
        assert!(matches!(err, SimilarityError::MissingEmbedding { .. }));
    }

    #[tokio::test]
    async fn empty_ids_are_invalid() {
        let store = Arc::new(MemoryStore::default());
        let engine = engine(store);
        assert!(matches!(
            engine.recompute_for_event("").await,
            Err(SimilarityError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.recompute_for_profile("ev", "").await,
            Err(SimilarityError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.connections("", "p").await,
            Err(SimilarityError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn whitespace_ids_are_opaque() {
        let store = Arc::new(MemoryStore::default());
        store.put(" ", " ", vector(&[1.0, 0.0])).await;
        store.put(" ", "  ", vector(&[1.0, 0.0])).await;

        let outcome = engine(store.clone())
            .recompute_for_profile(" ", " ")
            .await
            .unwrap();
        assert_eq!(outcome.scores_calculated, 1);
        assert_eq!(store.rows(" ").await, vec![row(" ", "  ", 1.0)]);
    }

    #[tokio::test]
    async fn duplicate_listing_never_yields_self_pairs() {
        let store = Arc::new(MemoryStore::default());
        store.put("ev", "P2", vector(&[0.0, 1.0])).await;
        {
            let mut profiles = store.profiles.write().await;
            let members = profiles.entry("ev".to_string()).or_default();
            members.push(("P1".to_string(), vector(&[1.0, 0.0])));
            members.push(("P1".to_string(), vector(&[1.0, 0.0])));
        }
        let engine = engine(store.clone());

        let outcome = engine.recompute_for_profile("ev", "P1").await.unwrap();
        assert_eq!(outcome.scores_calculated, 1);
        let outcome = engine.recompute_for_event("ev").await.unwrap();
        assert_eq!(outcome.scores_calculated, 1);

        let rows = store.rows("ev").await;
        assert_eq!(rows, vec![row("P1", "P2", 0.0)]);
        assert!(rows.iter().all(|(a, b, _)| a != b));
    }

    #[tokio::test]
    async fn staged_self_pair_is_not_written() {
        let store = Arc::new(MemoryStore::default());
        let mut staged = BTreeMap::new();
        for (a, b) in [("P1", "P1"), ("P1", "P2")] {
            staged.insert(
                (a.to_string(), b.to_string()),
                SimilarityRecord::new("ev", a, b, 1.0),
            );
        }

        let outcome = engine(store.clone()).persist("ev", staged, 0).await.unwrap();
        assert_eq!(outcome.scores_calculated, 1);
        assert_eq!(store.rows("ev").await, vec![row("P1", "P2", 1.0)]);

        let mut only_self = BTreeMap::new();
        only_self.insert(
            ("P3".to_string(), "P3".to_string()),
            SimilarityRecord::new("ev", "P3", "P3", 1.0),
        );
        let outcome = engine(store.clone()).persist("ev", only_self, 0).await.unwrap();
        assert_eq!(outcome.scores_calculated, 0);
        assert_eq!(*store.upserts.read().await, 1);
    }

    #[tokio::test]
    async fn unknown_subject_has_no_connections() {
        let store = Arc::new(MemoryStore::default());
        store.put("ev", "P1", vector(&[1.0, 0.0])).await;
        store.put("ev", "P2", vector(&[0.0, 1.0])).await;
        let engine = engine(store.clone());
        engine.recompute_for_event("ev").await.unwrap();

        assert!(engine.connections("ev", "stranger").await.unwrap().is_empty());
        assert!(engine.connections("other", "P1").await.unwrap().is_empty());
        assert_eq!(engine.connections("ev", "P1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_failures_propagate() {
        let reads = Arc::new(MemoryStore {
            fail_reads: true,
            ..Default::default()
        });
        assert!(matches!(
            engine(reads).recompute_for_event("ev").await,
            Err(SimilarityError::UpstreamRead(_))
        ));

        let writes = Arc::new(MemoryStore {
            fail_writes: true,
            ..Default::default()
        });
        writes.put("ev", "P1", vector(&[1.0, 0.0])).await;
        writes.put("ev", "P2", vector(&[0.0, 1.0])).await;
        assert!(matches!(
            engine(writes).recompute_for_profile("ev", "P1").await,
            Err(SimilarityError::UpstreamWrite(_))
        ));
    }

    #[tokio::test]
    async fn connections_rank_without_writing() {
        let store = Arc::new(MemoryStore::default());
        store.put("ev", "P1", vector(&[1.0, 0.0])).await;
        store.put("ev", "P2", vector(&[0.0, 1.0])).await;
        store.put("ev", "P3", vector(&[1.0, 1.0])).await;
        store.put("ev", "P4", Embedding::Absent).await;
        let engine = engine(store.clone());
        engine.recompute_for_profile("ev", "P1").await.unwrap();
        let upserts = *store.upserts.read().await;

        let ranked = engine.connections("ev", "P2").await.unwrap();
        let ids: Vec<_> = ranked.iter().map(|s| s.profile_id.as_str()).collect();
        // only (P1,P2) and (P1,P3) are stored, so P3 and P4 score zero for P2
        assert_eq!(ids, vec!["P1", "P3", "P4"]);
        assert!(ranked.iter().all(|s| s.similarity_score == 0.0));

        let ranked = engine.connections("ev", "P1").await.unwrap();
        let ids: Vec<_> = ranked.iter().map(|s| s.profile_id.as_str()).collect();
        assert_eq!(ids, vec!["P3", "P2", "P4"]);
        assert_eq!(ranked[0].item.name, "P3");
        assert_eq!(*store.upserts.read().await, upserts);
    }
}
