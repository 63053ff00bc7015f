//! Utilities for syncing a counter against a Supabase database.
//!
//! Reads go through PostgREST, writes through the `increment_counter` RPC
//! (see `supabase/migrations`), which adds the delta server-side and returns the new total.
use std::{rc::Rc, time::Duration};

use futures::{StreamExt, stream::LocalBoxStream};
use postgrest::Postgrest;
use serde_json::json;

use crate::remote::{CounterBackend, CounterId, SyncError};

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SupabaseConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
}

#[derive(Debug, thiserror::Error)]
#[error("environment variable {0} is not set")]
pub struct MissingEnvVar(&'static str);

impl SupabaseConfig {
    /// Reads `SUPABASE_URL` and `SUPABASE_ANON_KEY`, loading a `.env` file first if there is one.
    pub fn from_env() -> Result<Self, MissingEnvVar> {
        dotenvy::dotenv().ok();
        let supabase_url =
            std::env::var("SUPABASE_URL").map_err(|_| MissingEnvVar("SUPABASE_URL"))?;
        let supabase_anon_key =
            std::env::var("SUPABASE_ANON_KEY").map_err(|_| MissingEnvVar("SUPABASE_ANON_KEY"))?;
        Ok(Self {
            supabase_url,
            supabase_anon_key,
        })
    }
}

/// Where the counters live.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SupabaseCounterTable {
    pub table: String,
    pub id_column: String,
    pub value_column: String,
    pub increment_function: String,
}

impl Default for SupabaseCounterTable {
    fn default() -> Self {
        Self {
            table: "global_taps".to_string(),
            id_column: "id".to_string(),
            value_column: "total_taps".to_string(),
            increment_function: "increment_counter".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct SupabaseBackend {
    inner: Rc<Inner>,
    change_poll_interval: Duration,
}

struct Inner {
    client: Postgrest,
    table: SupabaseCounterTable,
}

impl SupabaseBackend {
    pub fn new(config: &SupabaseConfig, table: SupabaseCounterTable) -> Self {
        let SupabaseConfig {
            supabase_url,
            supabase_anon_key,
        } = config;

        let client = Postgrest::new(format!("{supabase_url}/rest/v1"))
            .insert_header("apikey", supabase_anon_key)
            .insert_header("Authorization", format!("Bearer {supabase_anon_key}"));

        Self {
            inner: Rc::new(Inner { client, table }),
            change_poll_interval: Duration::from_secs(2),
        }
    }

    /// How often [`CounterBackend::subscribe_to_changes`] checks for a new value.
    pub fn with_change_poll_interval(mut self, interval: Duration) -> Self {
        self.change_poll_interval = interval;
        self
    }
}

impl Inner {
    async fn read(&self, id: &CounterId) -> Result<u64, SyncError> {
        let response = self
            .client
            .from(&self.table.table)
            .select(&self.table.value_column)
            .eq(&self.table.id_column, id.as_str())
            .single()
            .execute()
            .await
            .map_err(|e| SyncError::Transient(format!("{e:?}")))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| SyncError::Transient(format!("{e:?}")))?;
        check_status(status, &body)?;

        let row: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            SyncError::Rejected(format!(
                "Failed to parse counter row: {e}\nResponse body: {body}"
            ))
        })?;
        row.get(&self.table.value_column)
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| {
                SyncError::Rejected(format!(
                    "Counter row has no non-negative `{}`: {body}",
                    self.table.value_column
                ))
            })
    }

    async fn increment(&self, id: &CounterId, delta: u64) -> Result<u64, SyncError> {
        let params = json!({ "p_id": id.as_str(), "p_delta": delta });
        let response = self
            .client
            .rpc(&self.table.increment_function, params.to_string())
            .execute()
            .await
            .map_err(|e| SyncError::Transient(format!("{e:?}")))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| SyncError::Transient(format!("{e:?}")))?;
        check_status(status, &body)?;

        // A null body means the id matched no row.
        serde_json::from_str::<Option<u64>>(&body)
            .map_err(|e| {
                SyncError::Rejected(format!(
                    "Failed to parse {} response: {e}. Body: {body}",
                    self.table.increment_function
                ))
            })?
            .ok_or_else(|| SyncError::Rejected(format!("No counter with id {id}")))
    }
}

fn check_status(status: u16, body: &str) -> Result<(), SyncError> {
    match status {
        200..=299 => Ok(()),
        408 | 429 | 500..=599 => Err(SyncError::Transient(format!(
            "request failed with status {status}: {body}"
        ))),
        _ => Err(SyncError::Rejected(format!(
            "request failed with status {status}: {body}"
        ))),
    }
}

impl CounterBackend for SupabaseBackend {
    async fn read_counter(&self, id: &CounterId) -> Result<u64, SyncError> {
        self.inner.read(id).await
    }

    async fn write_increment_delta(&self, id: &CounterId, delta: u64) -> Result<u64, SyncError> {
        self.inner.increment(id, delta).await
    }

    /// Realtime channels aren't available here, so changes are detected by re-reading the row
    /// and only emitting when the value moved.
    fn subscribe_to_changes(&self, id: &CounterId) -> LocalBoxStream<'static, u64> {
        let interval = self.change_poll_interval;
        let state = (Rc::clone(&self.inner), id.clone(), None::<u64>);
        futures::stream::unfold(state, move |(inner, id, mut last)| async move {
            loop {
                tokio::time::sleep(interval).await;
                match inner.read(&id).await {
                    Ok(value) if last != Some(value) => {
                        last = Some(value);
                        return Some((value, (inner, id, last)));
                    }
                    Ok(_) => {}
                    Err(SyncError::Rejected(e)) => {
                        log::error!("Stopping change feed for counter {id}: {e}");
                        return None;
                    }
                    Err(e) => log::debug!("Change feed read for counter {id} failed: {e}"),
                }
            }
        })
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_split_into_transient_and_rejected() {
        assert!(check_status(200, "").is_ok());
        assert!(check_status(503, "").unwrap_err().is_transient());
        assert!(check_status(429, "").unwrap_err().is_transient());
        assert!(!check_status(404, "").unwrap_err().is_transient());
        assert!(!check_status(401, "").unwrap_err().is_transient());
    }

    #[test]
    fn table_defaults_match_the_global_taps_schema() {
        let table: SupabaseCounterTable = serde_json::from_str("{}").unwrap();
        assert_eq!(table.table, "global_taps");
        assert_eq!(table.value_column, "total_taps");
        assert_eq!(table.increment_function, "increment_counter");
    }
}
