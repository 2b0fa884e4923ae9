//! Read access to already-confirmed on-chain events, used as a second de-duplication line that
//! survives restarts.

use crate::records::RecordKind;
use async_trait::async_trait;
use blindvote::normalize_hex;
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub type IndexerService = Arc<dyn Indexer>;

/// One confirmed batch as the indexer reports it. All values normalized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnChainEvent {
    pub voter_ids: Vec<String>,
    pub fingerprints: Vec<String>,
}

#[async_trait]
pub trait Indexer: Send + Sync {
    /// The `limit` most recent events of this kind for the election, newest first
    async fn fetch_recent(
        &self,
        kind: RecordKind,
        election_id: u64,
        limit: usize,
    ) -> eyre::Result<Vec<OnChainEvent>>;
}

const AUTHORIZATIONS_QUERY: &str = r#"
query RecentAuthorizations($electionId: BigInt!, $first: Int!) {
  events: votersAuthorizeds(
    first: $first
    orderBy: blockTimestamp
    orderDirection: desc
    where: { electionId: $electionId }
  ) {
    voters
  }
}
"#;

const REGISTRATIONS_QUERY: &str = r#"
query RecentRegistrations($electionId: BigInt!, $first: Int!) {
  events: votersRegistereds(
    first: $first
    orderBy: blockTimestamp
    orderDirection: desc
    where: { electionId: $electionId }
  ) {
    voters
    blindedSignatures
    blindedTokens
  }
}
"#;

#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: Variables,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Variables {
    election_id: String,
    first: usize,
}

#[derive(Deserialize)]
struct GraphQlResponse {
    data: Option<EventsData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct EventsData {
    events: Vec<SubgraphEvent>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubgraphEvent {
    voters: Vec<String>,
    #[serde(default)]
    blinded_signatures: Vec<String>,
    #[serde(default)]
    blinded_tokens: Vec<String>,
}

impl From<SubgraphEvent> for OnChainEvent {
    fn from(event: SubgraphEvent) -> Self {
        OnChainEvent {
            voter_ids: event.voters.iter().map(|v| normalize_hex(v)).collect(),
            fingerprints: event
                .blinded_signatures
                .iter()
                .chain(event.blinded_tokens.iter())
                .map(|v| normalize_hex(v))
                .collect(),
        }
    }
}

/// GraphQL subgraph client
pub struct SubgraphIndexer {
    client: reqwest::Client,
    url: String,
}

impl SubgraphIndexer {
    pub fn new(url: impl AsRef<str>, timeout: Duration) -> eyre::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .context("while building http client")?,
            url: url.as_ref().to_string(),
        })
    }
}

#[async_trait]
impl Indexer for SubgraphIndexer {
    async fn fetch_recent(
        &self,
        kind: RecordKind,
        election_id: u64,
        limit: usize,
    ) -> eyre::Result<Vec<OnChainEvent>> {
        let query = match kind {
            RecordKind::Authorization => AUTHORIZATIONS_QUERY,
            RecordKind::Registration => REGISTRATIONS_QUERY,
        };
        let body = GraphQlRequest {
            query,
            variables: Variables {
                election_id: election_id.to_string(),
                first: limit,
            },
        };

        let res = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("while querying subgraph")?
            .error_for_status()?;
        let res: GraphQlResponse = res.json().await.context("while decoding subgraph reply")?;

        if let Some(err) = res.errors.first() {
            eyre::bail!("subgraph error: {}", err.message);
        }
        let data = res
            .data
            .ok_or_else(|| eyre::eyre!("subgraph returned no data"))?;
        Ok(data.events.into_iter().map(OnChainEvent::from).collect())
    }
}
