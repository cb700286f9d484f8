//! Event processing: envelope decode, document rebuild, index upsert.
//!
//! The rebuild always reads from the primary store, never from the event
//! payload. That makes processing idempotent under replay and insensitive
//! to event ordering beyond the per-key guarantee: replaying every event
//! for a pair in any order converges on the same document.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;

use arbit_core::error::{Error, Result};
use arbit_core::search::{PairDoc, SearchClient, disagreement_score};

/// Event types that trigger a pair document rebuild.
const PAIR_UPSERT: &str = "pair.upsert";
const PAIR_STATS_RECOMPUTE: &str = "pair.stats.recompute";
// Reserved for a future responses index.
const RESPONSE_UPSERT: &str = "response.upsert";

/// The wire envelope wrapped around every queue message.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    /// Event type discriminator.
    pub event_type: String,
    /// Opaque payload; shape depends on the event type.
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PairIdPayload {
    #[serde(default)]
    pair_id: i64,
    #[serde(default)]
    #[allow(dead_code)]
    updated_at: Option<DateTime<Utc>>,
}

/// Handles one queue message.
///
/// Unknown event types are accepted and ignored for forward
/// compatibility; a malformed envelope or a missing pair id is an error
/// so the message can be redelivered or dead-lettered.
///
/// # Errors
///
/// Returns an error when the envelope cannot be decoded, the rebuild
/// query fails or the index upsert is rejected.
pub async fn handle_message(
    pool: &PgPool,
    client: &SearchClient,
    index: &str,
    value: &[u8],
) -> Result<()> {
    let envelope: Envelope = serde_json::from_slice(value)
        .map_err(|e| Error::Serialization {
            message: format!("bad envelope: {e}"),
        })?;

    match envelope.event_type.as_str() {
        PAIR_UPSERT | PAIR_STATS_RECOMPUTE => {
            let payload: PairIdPayload = serde_json::from_value(envelope.payload)
                .map_err(|e| Error::Serialization {
                    message: format!("bad payload: {e}"),
                })?;
            if payload.pair_id == 0 {
                return Err(Error::InvalidInput(format!(
                    "{} missing pair_id",
                    envelope.event_type
                )));
            }

            let doc = build_pair_doc(pool, payload.pair_id).await?;
            let doc_json = serde_json::to_value(&doc)?;
            client
                .index_doc(index, &payload.pair_id.to_string(), &doc_json)
                .await
        }
        RESPONSE_UPSERT => Ok(()),
        other => {
            tracing::debug!(event_type = %other, "ignoring unknown event type");
            Ok(())
        }
    }
}

#[derive(sqlx::FromRow)]
struct PairJoinRow {
    prompt_id: i64,
    created_at: DateTime<Utc>,
    title: String,
    body: String,
    a_id: i64,
    a_provider: String,
    a_model: String,
    a_content: String,
    b_id: i64,
    b_provider: String,
    b_model: String,
    b_content: String,
}

#[derive(sqlx::FromRow)]
struct VoteCounts {
    votes_total: i64,
    votes_a: i64,
    votes_b: i64,
    votes_tie: i64,
}

/// Builds the full pair document from the primary store.
///
/// # Errors
///
/// Returns [`Error::Database`] when the pair does not exist or a query
/// fails.
pub async fn build_pair_doc(pool: &PgPool, pair_id: i64) -> Result<PairDoc> {
    let pair = sqlx::query_as::<_, PairJoinRow>(
        r"
        select
          rp.prompt_id, rp.created_at,
          p.title, p.body,
          ra.id as a_id, ra.provider as a_provider, ra.model as a_model, ra.content as a_content,
          rb.id as b_id, rb.provider as b_provider, rb.model as b_model, rb.content as b_content
        from response_pairs rp
        join prompts p on p.id = rp.prompt_id
        join responses ra on ra.id = rp.response_a_id
        join responses rb on rb.id = rp.response_b_id
        where rp.id = $1
        ",
    )
    .bind(pair_id)
    .fetch_one(pool)
    .await?;

    let votes = sqlx::query_as::<_, VoteCounts>(
        r"
        select
          count(*) as votes_total,
          coalesce(sum(case when choice = 1 then 1 else 0 end), 0) as votes_a,
          coalesce(sum(case when choice = 2 then 1 else 0 end), 0) as votes_b,
          coalesce(sum(case when choice = 3 then 1 else 0 end), 0) as votes_tie
        from votes
        where pair_id = $1
        ",
    )
    .bind(pair_id)
    .fetch_one(pool)
    .await?;

    let score = disagreement_score(votes.votes_a, votes.votes_b, votes.votes_total);

    Ok(PairDoc {
        pair_id: pair_id.to_string(),
        prompt_id: pair.prompt_id.to_string(),
        created_at: Some(pair.created_at),
        updated_at: Some(Utc::now()),
        visibility: "public".to_string(),

        prompt_title: pair.title,
        prompt_body: pair.body,

        response_a_id: pair.a_id.to_string(),
        response_b_id: pair.b_id.to_string(),

        a_provider: pair.a_provider,
        a_model: pair.a_model,
        a_content: pair.a_content,

        b_provider: pair.b_provider,
        b_model: pair.b_model,
        b_content: pair.b_content,

        votes_total: votes.votes_total,
        votes_a: votes.votes_a,
        votes_b: votes.votes_b,
        votes_tie: votes.votes_tie,
        disagreement_score: score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_decodes_event_type_and_payload() {
        let envelope: Envelope = serde_json::from_slice(
            br#"{"event_type":"pair.stats.recompute","payload":{"pair_id":42,"updated_at":"2025-01-01T00:00:00Z"}}"#,
        )
        .expect("decode");
        assert_eq!(envelope.event_type, "pair.stats.recompute");

        let payload: PairIdPayload =
            serde_json::from_value(envelope.payload).expect("payload");
        assert_eq!(payload.pair_id, 42);
    }

    #[test]
    fn test_envelope_rejects_garbage() {
        assert!(serde_json::from_slice::<Envelope>(b"not json").is_err());
    }

    #[test]
    fn test_pair_payload_tolerates_missing_fields() {
        let payload: PairIdPayload = serde_json::from_value(serde_json::json!({})).expect("decode");
        assert_eq!(payload.pair_id, 0);
    }

    // Known values for the score: an even split of ten A/B votes scores
    // ln(11); a one-sided split scores zero.
    #[test]
    fn test_score_reference_values() {
        assert!((disagreement_score(5, 5, 10) - 2.3978952727983707).abs() < 1e-12);
        assert_eq!(disagreement_score(10, 0, 10), 0.0);
        assert_eq!(disagreement_score(0, 0, 0), 0.0);
    }
}
