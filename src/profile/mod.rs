pub mod embedder;

use anyhow::Result;
use async_openai::types::EmbeddingInput;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tiktoken_rs::cl100k_base;

/// Display attributes shown next to a suggested connection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileCard {
    pub name: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub interests: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSubmission {
    pub profile_id: String,
    pub name: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub resume_text: Option<String>,
}

impl Display for ProfileSubmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ProfileSubmission {{ profile_id: {}, name: {}, skills: {}, interests: {} }}",
            self.profile_id,
            self.name,
            self.skills.len(),
            self.interests.len()
        )
    }
}

impl ProfileSubmission {
    pub fn card(&self) -> ProfileCard {
        ProfileCard {
            name: self.name.clone(),
            image_url: self.image_url.clone(),
            skills: self.skills.clone(),
            interests: self.interests.clone(),
        }
    }
}

/// Text handed to the embedding model for one profile.
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileText(String);

impl ProfileText {
    pub fn compose(submission: &ProfileSubmission, max_tokens: usize) -> Result<Self> {
        let mut sections = vec![];
        let name = submission.name.trim();
        if !name.is_empty() {
            sections.push(name.to_string());
        }
        let skills = join_terms(&submission.skills);
        if !skills.is_empty() {
            sections.push(format!("Skills: {}", skills));
        }
        let interests = join_terms(&submission.interests);
        if !interests.is_empty() {
            sections.push(format!("Interests: {}", interests));
        }
        if let Some(resume) = &submission.resume_text {
            let resume = resume.replace("\r\n", "\n");
            let resume = resume.trim();
            if !resume.is_empty() {
                sections.push(resume.to_string());
            }
        }

        let text = truncate_tokens(&sections.join("\n"), max_tokens)?;
        Ok(ProfileText(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.as_str().trim().is_empty()
    }
}

impl From<ProfileText> for EmbeddingInput {
    fn from(val: ProfileText) -> Self {
        EmbeddingInput::String(val.0)
    }
}

fn join_terms(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

fn truncate_tokens(text: &str, max_tokens: usize) -> Result<String> {
    let bpe = cl100k_base()?;
    let tokens = bpe.encode_with_special_tokens(text);
    if tokens.len() <= max_tokens {
        return Ok(text.to_string());
    }
    debug!("truncate profile text from {} to {} tokens", tokens.len(), max_tokens);
    bpe.decode(tokens[..max_tokens].to_vec())
}
