//! Pairwise vote recording and random-pair sampling.
//!
//! A vote and its indexing event share one transaction: either both exist
//! after commit or neither does. Duplicate votes are detected through the
//! `(pair_id, voter_id)` uniqueness constraint and reported as
//! [`VoteStatus::Duplicate`] without emitting a new event.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;

use crate::error::{Error, Result};
use crate::outbox::{NewOutboxEvent, insert_event};

/// Topic every pair indexing event is published to.
pub const SEARCH_INDEX_TOPIC: &str = "search-index";

/// Event type emitted after a recorded vote.
pub const PAIR_STATS_RECOMPUTE: &str = "pair.stats.recompute";

/// A voter's verdict on a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Choice {
    /// Response A wins.
    A,
    /// Response B wins.
    B,
    /// Neither wins.
    Tie,
}

impl Choice {
    /// The smallint code stored in the votes table.
    #[must_use]
    pub fn code(self) -> i16 {
        match self {
            Self::A => 1,
            Self::B => 2,
            Self::Tie => 3,
        }
    }
}

/// Outcome of a vote insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteStatus {
    /// The vote was stored and an indexing event enqueued.
    Recorded,
    /// The voter had already voted on this pair; nothing changed.
    Duplicate,
}

impl VoteStatus {
    /// Wire representation used in API responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recorded => "recorded",
            Self::Duplicate => "duplicate",
        }
    }
}

/// One response within a pair DTO.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDto {
    /// Response row id.
    pub response_id: i64,
    /// Provider that produced the response.
    pub provider: String,
    /// Model that produced the response.
    pub model: String,
    /// Response text.
    pub content: String,
}

/// A pair joined with its prompt and both responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairDto {
    /// Pair row id.
    pub pair_id: i64,
    /// Prompt row id.
    pub prompt_id: i64,
    /// Prompt title.
    pub title: String,
    /// Prompt body.
    pub prompt: String,
    /// Response A.
    pub a: ResponseDto,
    /// Response B.
    pub b: ResponseDto,
}

#[derive(sqlx::FromRow)]
struct PairRow {
    prompt_id: i64,
    title: String,
    body: String,
    pair_id: i64,
    a_id: i64,
    a_provider: String,
    a_model: String,
    a_content: String,
    b_id: i64,
    b_provider: String,
    b_model: String,
    b_content: String,
}

impl From<PairRow> for PairDto {
    fn from(row: PairRow) -> Self {
        Self {
            pair_id: row.pair_id,
            prompt_id: row.prompt_id,
            title: row.title,
            prompt: row.body,
            a: ResponseDto {
                response_id: row.a_id,
                provider: row.a_provider,
                model: row.a_model,
                content: row.a_content,
            },
            b: ResponseDto {
                response_id: row.b_id,
                provider: row.b_provider,
                model: row.b_model,
                content: row.b_content,
            },
        }
    }
}

/// Vote recording and pair sampling over the primary store.
#[derive(Debug, Clone)]
pub struct VotingService {
    pool: PgPool,
}

impl VotingService {
    /// Creates a service over the shared pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Records a vote and enqueues the indexing event atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] when either write fails; the
    /// transaction rolls back and no partial state remains.
    pub async fn create_vote(
        &self,
        pair_id: i64,
        voter_id: &str,
        choice: Choice,
    ) -> Result<VoteStatus> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r"
            insert into votes (pair_id, voter_id, choice)
            values ($1, $2, $3)
            on conflict (pair_id, voter_id) do nothing
            ",
        )
        .bind(pair_id)
        .bind(voter_id)
        .bind(choice.code())
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Duplicate vote: no stats changed, no indexing event needed.
            tx.commit().await?;
            return Ok(VoteStatus::Duplicate);
        }

        // The key keeps all updates for one pair ordered downstream; the
        // payload stays small because the indexer re-reads full stats from
        // the primary store.
        insert_event(
            &mut tx,
            &NewOutboxEvent {
                topic: SEARCH_INDEX_TOPIC.to_string(),
                key: format!("pair:{pair_id}"),
                event_type: PAIR_STATS_RECOMPUTE.to_string(),
                payload: json!({
                    "pair_id": pair_id,
                    "updated_at": Utc::now(),
                }),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(VoteStatus::Recorded)
    }

    /// Returns a uniformly random pair, optionally restricted to a prompt.
    ///
    /// Offset sampling is acceptable for small-to-medium tables; a
    /// large-table replacement is deferred.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when no pair matches the filter,
    /// [`Error::Database`] on query failure.
    pub async fn random_pair(&self, prompt_id: Option<i64>) -> Result<PairDto> {
        let count: i64 = match prompt_id {
            None => {
                sqlx::query_scalar("select count(*) from response_pairs")
                    .fetch_one(&self.pool)
                    .await?
            }
            Some(prompt_id) => {
                sqlx::query_scalar("select count(*) from response_pairs where prompt_id = $1")
                    .bind(prompt_id)
                    .fetch_one(&self.pool)
                    .await?
            }
        };

        if count == 0 {
            return Err(Error::not_found(
                "pair",
                prompt_id.map_or_else(|| "any".to_string(), |id| format!("prompt:{id}")),
            ));
        }

        let offset = rand::thread_rng().gen_range(0..count);

        let row = match prompt_id {
            None => {
                sqlx::query_as::<_, PairRow>(
                    r"
                    select
                      p.id as prompt_id, p.title, p.body,
                      rp.id as pair_id,
                      ra.id as a_id, ra.provider as a_provider, ra.model as a_model, ra.content as a_content,
                      rb.id as b_id, rb.provider as b_provider, rb.model as b_model, rb.content as b_content
                    from response_pairs rp
                    join prompts p on p.id = rp.prompt_id
                    join responses ra on ra.id = rp.response_a_id
                    join responses rb on rb.id = rp.response_b_id
                    order by rp.id
                    limit 1 offset $1
                    ",
                )
                .bind(offset)
                .fetch_one(&self.pool)
                .await?
            }
            Some(prompt_id) => {
                sqlx::query_as::<_, PairRow>(
                    r"
                    select
                      p.id as prompt_id, p.title, p.body,
                      rp.id as pair_id,
                      ra.id as a_id, ra.provider as a_provider, ra.model as a_model, ra.content as a_content,
                      rb.id as b_id, rb.provider as b_provider, rb.model as b_model, rb.content as b_content
                    from response_pairs rp
                    join prompts p on p.id = rp.prompt_id
                    join responses ra on ra.id = rp.response_a_id
                    join responses rb on rb.id = rp.response_b_id
                    where rp.prompt_id = $1
                    order by rp.id
                    limit 1 offset $2
                    ",
                )
                .bind(prompt_id)
                .bind(offset)
                .fetch_one(&self.pool)
                .await?
            }
        };

        Ok(row.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choice_codes_match_table_encoding() {
        assert_eq!(Choice::A.code(), 1);
        assert_eq!(Choice::B.code(), 2);
        assert_eq!(Choice::Tie.code(), 3);
    }

    #[test]
    fn test_choice_parses_wire_values() {
        assert_eq!(
            serde_json::from_str::<Choice>(r#""A""#).expect("parse"),
            Choice::A
        );
        assert_eq!(
            serde_json::from_str::<Choice>(r#""B""#).expect("parse"),
            Choice::B
        );
        assert_eq!(
            serde_json::from_str::<Choice>(r#""TIE""#).expect("parse"),
            Choice::Tie
        );
        assert!(serde_json::from_str::<Choice>(r#""C""#).is_err());
        assert!(serde_json::from_str::<Choice>(r#""tie""#).is_err());
    }

    #[test]
    fn test_vote_status_wire_strings() {
        assert_eq!(VoteStatus::Recorded.as_str(), "recorded");
        assert_eq!(VoteStatus::Duplicate.as_str(), "duplicate");
    }

    #[test]
    fn test_pair_dto_serializes_camel_case() {
        let dto = PairDto {
            pair_id: 42,
            prompt_id: 7,
            title: "t".to_string(),
            prompt: "p".to_string(),
            a: ResponseDto {
                response_id: 1,
                provider: "x".to_string(),
                model: "m".to_string(),
                content: "c".to_string(),
            },
            b: ResponseDto {
                response_id: 2,
                provider: "y".to_string(),
                model: "n".to_string(),
                content: "d".to_string(),
            },
        };

        let value = serde_json::to_value(&dto).expect("serialize");
        assert_eq!(value["pairId"], 42);
        assert_eq!(value["promptId"], 7);
        assert_eq!(value["a"]["responseId"], 1);
        assert_eq!(value["b"]["provider"], "y");
    }
}
