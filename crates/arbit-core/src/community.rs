//! Community conversation listing and feedback scores.

use serde::{Serialize, Serializer};
use sqlx::PgPool;

use crate::error::{Error, Result};

// Feedback deltas far outside the UI range indicate a broken caller.
const MAX_FEEDBACK_DELTA: i32 = 10;

/// Default page size for conversation listings.
pub const DEFAULT_LIST_LIMIT: i64 = 20;

fn serialize_id_as_string<S: Serializer>(id: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&id.to_string())
}

/// One community alignment conversation.
///
/// `conversation_id` is string-encoded on the wire so JavaScript clients
/// never truncate it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CommunityConversation {
    /// Conversation id, string-encoded in JSON.
    #[serde(serialize_with = "serialize_id_as_string")]
    pub conversation_id: i64,
    /// Language the conversation was assigned.
    pub assigned_lang: String,
    /// First-turn prompt text.
    pub first_turn_prompt: String,
    /// First-turn response A text.
    pub first_turn_response_a: String,
    /// First-turn response B text.
    pub first_turn_response_b: String,
    /// Optional first-turn feedback text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_turn_feedback: Option<String>,
    /// Accumulated feedback score.
    pub feedback_score: i32,
}

/// A page of conversations.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationPage {
    /// Conversations, newest first.
    pub items: Vec<CommunityConversation>,
    /// Cursor for the next page, when one exists.
    #[serde(rename = "next_cursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Community conversation reads and feedback writes.
#[derive(Debug, Clone)]
pub struct CommunityService {
    pool: PgPool,
}

impl CommunityService {
    /// Creates a service over the shared pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lists conversations, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] on query failure.
    pub async fn list_conversations(&self, limit: i64) -> Result<ConversationPage> {
        let limit = if limit <= 0 { DEFAULT_LIST_LIMIT } else { limit };

        let items = sqlx::query_as::<_, CommunityConversation>(
            r"
            select
                conversation_id,
                assigned_lang,
                first_turn_prompt,
                first_turn_response_a,
                first_turn_response_b,
                first_turn_feedback,
                feedback_score
            from community_alignment_conversations
            order by conversation_id desc
            limit $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(rows = items.len(), "listed community conversations");

        Ok(ConversationPage {
            items,
            next_cursor: None,
        })
    }

    /// Adjusts a conversation's feedback score and returns the new value.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] when the delta is outside the sanity range,
    /// [`Error::NotFound`] when the conversation does not exist,
    /// [`Error::Database`] on query failure.
    pub async fn add_feedback_score(&self, conversation_id: i64, delta: i32) -> Result<i32> {
        if !(-MAX_FEEDBACK_DELTA..=MAX_FEEDBACK_DELTA).contains(&delta) {
            return Err(Error::InvalidInput("delta out of range".to_string()));
        }

        let new_score: Option<i32> = sqlx::query_scalar(
            r"
            update community_alignment_conversations
            set feedback_score = feedback_score + $1
            where conversation_id = $2
            returning feedback_score
            ",
        )
        .bind(delta)
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        new_score.ok_or_else(|| Error::not_found("conversation", conversation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_id_is_string_encoded() {
        let conversation = CommunityConversation {
            conversation_id: 9_007_199_254_740_993,
            assigned_lang: "en".to_string(),
            first_turn_prompt: "p".to_string(),
            first_turn_response_a: "a".to_string(),
            first_turn_response_b: "b".to_string(),
            first_turn_feedback: None,
            feedback_score: 3,
        };

        let value = serde_json::to_value(&conversation).expect("serialize");
        assert_eq!(value["conversation_id"], "9007199254740993");
        assert!(value.get("first_turn_feedback").is_none());
        assert_eq!(value["feedback_score"], 3);
    }
}
