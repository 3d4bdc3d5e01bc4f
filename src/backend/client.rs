// SPDX-License-Identifier: MPL-2.0

//! REST implementation of the data-service contract.
//!
//! CRUD goes over plain JSON endpoints with equality filters in the query
//! string. The change feed is a long-lived streaming response of
//! newline-delimited JSON frames; blank lines and `:`-prefixed keepalives
//! are skipped.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::backend::types::{
    ListingRow, NotificationRow, ProfileRow, ReplyRow, ThreadRow, VoteRow, WatermarkRow,
};
use crate::backend::{ChangeKind, ChangeMessage, ChangeSource, ChannelScope, ClientError, DataService};
use crate::runtime;
use async_trait::async_trait;

/// Wraps the backend so the rest of the engine only sees our own types.
pub struct RestClient {
    http: reqwest::Client,
    base: String,
}

impl RestClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| ClientError::InvalidResponse(format!("invalid service url: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base, path)
    }

    fn check(status: reqwest::StatusCode) -> Result<(), ClientError> {
        if status == reqwest::StatusCode::CONFLICT {
            return Err(ClientError::Conflict);
        }
        if !status.is_success() {
            return Err(ClientError::Status(status.as_u16()));
        }
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ClientError> {
        let resp = self
            .http
            .get(self.endpoint(path))
            .query(query)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        Self::check(resp.status())?;
        resp.json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn send_json<B: Serialize + Sync>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<(), ClientError> {
        let resp = self
            .http
            .request(method, self.endpoint(path))
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        Self::check(resp.status())
    }

    async fn delete(&self, path: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .delete(self.endpoint(path))
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        Self::check(resp.status())
    }
}

#[async_trait]
impl DataService for RestClient {
    async fn fetch_thread(&self, thread_id: &str) -> Result<ThreadRow, ClientError> {
        self.get_json(&format!("threads/{thread_id}"), &[]).await
    }

    async fn fetch_threads(&self, community_id: &str) -> Result<Vec<ThreadRow>, ClientError> {
        self.get_json("threads", &[("community_id", community_id)])
            .await
    }

    async fn fetch_replies(&self, thread_id: &str) -> Result<Vec<ReplyRow>, ClientError> {
        self.get_json("replies", &[("thread_id", thread_id)]).await
    }

    async fn fetch_listings(&self, community_id: &str) -> Result<Vec<ListingRow>, ClientError> {
        self.get_json("listings", &[("community_id", community_id)])
            .await
    }

    async fn fetch_vote(
        &self,
        thread_id: &str,
        user_id: &str,
    ) -> Result<Option<VoteRow>, ClientError> {
        let rows: Vec<VoteRow> = self
            .get_json("votes", &[("thread_id", thread_id), ("user_id", user_id)])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_votes(&self, user_id: &str) -> Result<Vec<VoteRow>, ClientError> {
        self.get_json("votes", &[("user_id", user_id)]).await
    }

    async fn insert_vote(&self, vote: &VoteRow) -> Result<(), ClientError> {
        self.send_json(reqwest::Method::POST, "votes", vote).await
    }

    async fn update_vote(&self, vote: &VoteRow) -> Result<(), ClientError> {
        let path = format!("votes/{}/{}", vote.thread_id, vote.user_id);
        self.send_json(reqwest::Method::PATCH, &path, vote).await
    }

    async fn delete_vote(&self, thread_id: &str, user_id: &str) -> Result<(), ClientError> {
        self.delete(&format!("votes/{thread_id}/{user_id}")).await
    }

    async fn upsert_watermark(&self, mark: &WatermarkRow) -> Result<(), ClientError> {
        self.send_json(reqwest::Method::PUT, "watermarks", mark)
            .await
    }

    async fn fetch_watermarks(&self, user_id: &str) -> Result<Vec<WatermarkRow>, ClientError> {
        self.get_json("watermarks", &[("user_id", user_id)]).await
    }

    async fn count_replies(
        &self,
        thread_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64, ClientError> {
        #[derive(Deserialize)]
        struct CountBody {
            count: u64,
        }
        let since_str = since.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true));
        let mut query: Vec<(&str, &str)> = vec![("thread_id", thread_id)];
        if let Some(ref s) = since_str {
            query.push(("since", s));
        }
        let body: CountBody = self.get_json("replies/count", &query).await?;
        Ok(body.count)
    }

    async fn fetch_notifications(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<NotificationRow>, ClientError> {
        let limit_str = limit.to_string();
        self.get_json(
            "notifications",
            &[("recipient_id", user_id), ("limit", &limit_str)],
        )
        .await
    }

    async fn mark_notifications_read(&self, user_id: &str) -> Result<(), ClientError> {
        self.send_json(
            reqwest::Method::POST,
            "notifications/read",
            &serde_json::json!({ "user_id": user_id }),
        )
        .await
    }

    async fn profiles_by_ids(&self, ids: &[String]) -> Result<Vec<ProfileRow>, ClientError> {
        let resp = self
            .http
            .post(self.endpoint("profiles/lookup"))
            .json(&serde_json::json!({ "ids": ids }))
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        Self::check(resp.status())?;
        resp.json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }
}

/// Wire shape of one change-feed frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum ChangeFrame {
    Insert { row: serde_json::Value },
    Update { row: serde_json::Value },
    Delete { id: String },
}

impl From<ChangeFrame> for ChangeMessage {
    fn from(frame: ChangeFrame) -> Self {
        match frame {
            ChangeFrame::Insert { row } => Self {
                kind: ChangeKind::Insert,
                row: Some(row),
                deleted_id: None,
            },
            ChangeFrame::Update { row } => Self {
                kind: ChangeKind::Update,
                row: Some(row),
                deleted_id: None,
            },
            ChangeFrame::Delete { id } => Self {
                kind: ChangeKind::Delete,
                row: None,
                deleted_id: Some(id),
            },
        }
    }
}

#[async_trait]
impl ChangeSource for RestClient {
    async fn open(
        &self,
        scope: &ChannelScope,
    ) -> Result<mpsc::Receiver<ChangeMessage>, ClientError> {
        let query: Vec<(&str, &str)> = vec![
            ("table", scope.table),
            (scope.filter_column, &scope.filter_value),
        ];
        let resp = self
            .http
            .get(self.endpoint("changes"))
            .query(&query)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        Self::check(resp.status())?;

        let (tx, rx) = mpsc::channel(64);
        debug!(channel = %scope.key(), "change channel opened");
        runtime::spawn(pump_frames(resp, tx, scope.key()));
        Ok(rx)
    }
}

/// Read the streaming response line by line and forward decoded frames.
/// Returning drops `tx`, which the subscription layer sees as channel death.
async fn pump_frames(
    mut resp: reqwest::Response,
    tx: mpsc::Sender<ChangeMessage>,
    key: String,
) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        match resp.chunk().await {
            Ok(Some(bytes)) => {
                buf.extend_from_slice(&bytes);
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line_bytes: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line_bytes);
                    let line = line.trim();
                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    match serde_json::from_str::<ChangeFrame>(line) {
                        Ok(frame) => {
                            if tx.send(frame.into()).await.is_err() {
                                // Subscriber unsubscribed; stop reading.
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(channel = %key, error = %e, "undecodable change frame skipped");
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(channel = %key, error = %e, "change stream failed");
                break;
            }
        }
    }
}
