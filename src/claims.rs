//! Short-TTL dedup claims asserting "this (project, event_id) is in flight".
//!
//! Ingest handlers claim synchronously before publishing; the consumer
//! releases claims when a batch lands in the DLQ so a client retry is
//! accepted. The successful path relies on the residual TTL plus OLAP merge
//! semantics to absorb SDK retries.

use std::time::Duration;

use redis::aio::ConnectionManager;

pub fn claim_key(project_id: &str, event_id: &str) -> String {
    format!("claim:{project_id}:{event_id}")
}

#[derive(Debug, Default)]
pub struct ClaimOutcome {
    pub claimed: Vec<String>,
    pub already_claimed: Vec<String>,
}

/// Split event ids by the per-key SET NX replies of the claim pipeline:
/// a nil reply means some other ingest already holds the claim.
fn partition_claims(event_ids: &[String], replies: &[Option<String>]) -> ClaimOutcome {
    let mut outcome = ClaimOutcome::default();
    for (id, reply) in event_ids.iter().zip(replies) {
        if reply.is_some() {
            outcome.claimed.push(id.clone());
        } else {
            outcome.already_claimed.push(id.clone());
        }
    }
    outcome
}

#[derive(Clone)]
pub struct ClaimStore {
    con: ConnectionManager,
    ttl: Duration,
}

impl ClaimStore {
    pub fn new(con: ConnectionManager, ttl: Duration) -> Self {
        Self { con, ttl }
    }

    pub async fn connect(url: &str, ttl: Duration) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let con = ConnectionManager::new(client).await?;
        Ok(Self::new(con, ttl))
    }

    /// Claim the whole set in one MULTI pipeline of `SET NX EX`. The pipeline
    /// either executes completely or errors out with nothing claimed; per-key
    /// nil replies split the ids into claimed vs already-claimed.
    pub async fn claim_events(
        &self,
        project_id: &str,
        event_ids: &[String],
    ) -> anyhow::Result<ClaimOutcome> {
        if event_ids.is_empty() {
            return Ok(ClaimOutcome::default());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for event_id in event_ids {
            pipe.cmd("SET")
                .arg(claim_key(project_id, event_id))
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(self.ttl.as_secs());
        }
        let mut con = self.con.clone();
        let replies: Vec<Option<String>> = pipe.query_async(&mut con).await?;
        Ok(partition_claims(event_ids, &replies))
    }

    pub async fn release_events(
        &self,
        project_id: &str,
        event_ids: &[String],
    ) -> anyhow::Result<()> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = event_ids
            .iter()
            .map(|id| claim_key(project_id, id))
            .collect();
        let mut con = self.con.clone();
        let _: i64 = redis::AsyncCommands::del(&mut con, keys).await?;
        Ok(())
    }

    pub async fn is_claimed(&self, project_id: &str, event_id: &str) -> anyhow::Result<bool> {
        let mut con = self.con.clone();
        let exists: bool =
            redis::AsyncCommands::exists(&mut con, claim_key(project_id, event_id)).await?;
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_key_layout() {
        assert_eq!(claim_key("proj-1", "ev-1"), "claim:proj-1:ev-1");
    }

    #[test]
    fn partition_splits_on_nil_replies() {
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let replies = vec![Some("OK".to_string()), None, Some("OK".to_string())];
        let outcome = partition_claims(&ids, &replies);
        assert_eq!(outcome.claimed, vec!["a", "c"]);
        assert_eq!(outcome.already_claimed, vec!["b"]);
    }

    #[test]
    fn empty_set_claims_nothing() {
        let outcome = partition_claims(&[], &[]);
        assert!(outcome.claimed.is_empty());
        assert!(outcome.already_claimed.is_empty());
    }
}
