// storage protocol, every <id> segment is hex encoded:
//
// events/<event>/members                 -> json array of profile ids
// events/<event>/profiles/<id>/card      -> json ProfileCard
// events/<event>/profiles/<id>/vector    -> little endian f32 bytes, missing until embedded
// events/<event>/similarities            -> json array of SimilarityRecord
//
// writes are mutually exclusive, reads may run alongside one write

use super::engine::{Embedding, Member, ProfileEmbedding, ProfileStore, SimilarityStore};
use super::matching::SimilarityRecord;
use crate::profile::ProfileCard;
use anyhow::Result;
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use opendal::services::Sled;
use opendal::{ErrorKind, Operator};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct Storage {
    pub operator: Operator,
    semaphore: Arc<Semaphore>,
}

impl Storage {
    pub fn new(datadir: &str) -> Result<Self> {
        let mut builder = Sled::default();
        builder.datadir(datadir);

        Ok(Storage {
            operator: Operator::new(builder)?.finish(),
            semaphore: Arc::new(Semaphore::new(1)),
        })
    }

    /// Adds the profile to the event and stores its card. Re-registering keeps the member order.
    pub async fn save_card(
        &self,
        event_id: &str,
        profile_id: &str,
        card: &ProfileCard,
    ) -> Result<()> {
        let _permit = self.semaphore.acquire().await?;
        let mut members = self.read_members(event_id).await?;
        if !members.iter().any(|m| m == profile_id) {
            members.push(profile_id.to_string());
            self.operator
                .write(&members_key(event_id), serde_json::to_vec(&members)?)
                .await?;
        }
        self.operator
            .write(
                &(profile_key(event_id, profile_id) + "/card"),
                serde_json::to_vec(card)?,
            )
            .await?;
        debug!("store card: event: {}, profile: {}", event_id, profile_id);
        Ok(())
    }

    /// Replaces the stored embedding of a profile.
    pub async fn save_vector(
        &self,
        event_id: &str,
        profile_id: &str,
        vector: &[f32],
    ) -> Result<()> {
        let _permit = self.semaphore.acquire().await?;
        self.operator
            .write(
                &(profile_key(event_id, profile_id) + "/vector"),
                float_to_bytes(vector),
            )
            .await?;
        debug!(
            "store vector: event: {}, profile: {}, dimensions: {}",
            event_id,
            profile_id,
            vector.len()
        );
        Ok(())
    }

    /// Drops the stored embedding so the profile counts as not embedded.
    pub async fn clear_vector(&self, event_id: &str, profile_id: &str) -> Result<()> {
        let _permit = self.semaphore.acquire().await?;
        self.operator
            .delete(&(profile_key(event_id, profile_id) + "/vector"))
            .await?;
        debug!("clear vector: event: {}, profile: {}", event_id, profile_id);
        Ok(())
    }

    async fn read_members(&self, event_id: &str) -> Result<Vec<String>> {
        match self.read_optional(&members_key(event_id)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(vec![]),
        }
    }

    async fn read_embedding(&self, event_id: &str, profile_id: &str) -> Result<Embedding> {
        let bytes = self
            .read_optional(&(profile_key(event_id, profile_id) + "/vector"))
            .await?;
        Ok(match bytes {
            None => Embedding::Absent,
            Some(bytes) if bytes.len() % 4 != 0 => {
                Embedding::Unreadable(format!("{} bytes is not a f32 vector", bytes.len()))
            }
            Some(bytes) => Embedding::Vector(bytes_to_float(&bytes)),
        })
    }

    async fn read_card(&self, event_id: &str, profile_id: &str) -> Result<ProfileCard> {
        match self
            .read_optional(&(profile_key(event_id, profile_id) + "/card"))
            .await?
        {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(ProfileCard::default()),
        }
    }

    async fn read_records(&self, event_id: &str) -> Result<Vec<SimilarityRecord>> {
        match self.read_optional(&similarities_key(event_id)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(vec![]),
        }
    }

    async fn read_optional(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.operator.read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ProfileStore for Storage {
    async fn embedded_profiles(&self, event_id: &str) -> Result<Vec<ProfileEmbedding>> {
        let mut profiles = vec![];
        for id in self.read_members(event_id).await? {
            let embedding = self.read_embedding(event_id, &id).await?;
            if embedding != Embedding::Absent {
                profiles.push(ProfileEmbedding { id, embedding });
            }
        }
        Ok(profiles)
    }

    async fn members(&self, event_id: &str) -> Result<Vec<Member>> {
        let ids = self.read_members(event_id).await?;
        let cards =
            futures::future::try_join_all(ids.iter().map(|id| self.read_card(event_id, id)))
                .await?;
        Ok(ids
            .into_iter()
            .zip(cards)
            .map(|(id, card)| Member { id, card })
            .collect())
    }
}

#[async_trait]
impl SimilarityStore for Storage {
    async fn upsert(&self, event_id: &str, records: Vec<SimilarityRecord>) -> Result<()> {
        let _permit = self.semaphore.acquire().await?;
        let mut table = self
            .read_records(event_id)
            .await?
            .into_iter()
            .map(|r| ((r.profile_id_1.clone(), r.profile_id_2.clone()), r))
            .collect::<BTreeMap<_, _>>();
        let count = records.len();
        for record in records {
            table.insert(
                (record.profile_id_1.clone(), record.profile_id_2.clone()),
                record,
            );
        }
        let rows = table.into_values().collect::<Vec<_>>();
        self.operator
            .write(&similarities_key(event_id), serde_json::to_vec(&rows)?)
            .await?;
        debug!(
            "upsert similarities: event: {}, written: {}, total: {}",
            event_id,
            count,
            rows.len()
        );
        Ok(())
    }

    async fn similarities_for(
        &self,
        event_id: &str,
        profile_id: &str,
    ) -> Result<Vec<SimilarityRecord>> {
        Ok(self
            .read_records(event_id)
            .await?
            .into_iter()
            .filter(|r| r.counterpart(profile_id).is_some())
            .collect())
    }
}

fn segment(id: &str) -> String {
    id.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn event_key(event_id: &str) -> String {
    "events/".to_string() + &segment(event_id)
}

fn members_key(event_id: &str) -> String {
    event_key(event_id) + "/members"
}

fn similarities_key(event_id: &str) -> String {
    event_key(event_id) + "/similarities"
}

fn profile_key(event_id: &str, profile_id: &str) -> String {
    event_key(event_id) + "/profiles/" + &segment(profile_id)
}

fn float_to_bytes(float_vec: &[f32]) -> Vec<u8> {
    let mut byte_vec = vec![0u8; float_vec.len() * 4];
    LittleEndian::write_f32_into(float_vec, &mut byte_vec);
    byte_vec
}

fn bytes_to_float(byte_vec: &[u8]) -> Vec<f32> {
    let mut float_vec = vec![0f32; byte_vec.len() / 4];
    LittleEndian::read_f32_into(byte_vec, &mut float_vec);
    float_vec
}
