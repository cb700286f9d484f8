//! Search-index client, pair documents and the pair search service.
//!
//! The index is a derived replica: documents are rebuilt from the primary
//! store by the indexer and queried here. The service talks to OpenSearch
//! over plain HTTP; the four calls it needs (exists, create, index,
//! search) do not justify a vendor SDK.
//!
//! Pagination is `search_after`-style: the opaque cursor is the previous
//! page's tail sort vector, base64url-encoded.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Error, Result};

/// Name of the pairs index.
pub const PAIRS_INDEX: &str = "pairs_v1";

/// Hard cap on one page of search results.
pub const MAX_SEARCH_LIMIT: usize = 100;

/// Default page size.
pub const DEFAULT_SEARCH_LIMIT: usize = 20;

// ============================================================================
// Disagreement score
// ============================================================================

/// Scores how contested a pair is.
///
/// Peaks at a 50/50 A-vs-B split and grows sublinearly with vote volume:
/// `(1 - |2p - 1|) * ln(1 + total)` where `p = a / (a + b)`. Tie votes
/// count toward volume but not toward the split.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn disagreement_score(votes_a: i64, votes_b: i64, votes_total: i64) -> f64 {
    let ab = votes_a + votes_b;
    if ab <= 0 {
        return 0.0;
    }
    let p = votes_a as f64 / ab as f64;
    let disagree = 1.0 - (2.0 * p - 1.0).abs();
    disagree * (votes_total as f64).ln_1p()
}

// ============================================================================
// Documents and DTOs
// ============================================================================

/// The full pair document stored in the search index.
///
/// Identifiers are keyword strings; the indexer owns every field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairDoc {
    /// Pair id (keyword).
    pub pair_id: String,
    /// Prompt id (keyword).
    pub prompt_id: String,
    /// Pair creation time.
    #[serde(default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Last rebuild time.
    #[serde(default)]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Visibility tag.
    pub visibility: String,

    /// Prompt title.
    pub prompt_title: String,
    /// Prompt body.
    pub prompt_body: String,

    /// Response A id (keyword).
    pub response_a_id: String,
    /// Response B id (keyword).
    pub response_b_id: String,

    /// Response A provider.
    pub a_provider: String,
    /// Response A model.
    pub a_model: String,
    /// Response A content.
    pub a_content: String,

    /// Response B provider.
    pub b_provider: String,
    /// Response B model.
    pub b_model: String,
    /// Response B content.
    pub b_content: String,

    /// Total votes on the pair.
    pub votes_total: i64,
    /// Votes for A.
    pub votes_a: i64,
    /// Votes for B.
    pub votes_b: i64,
    /// Tie votes.
    pub votes_tie: i64,
    /// Contestedness score.
    pub disagreement_score: f64,
}

/// Vote counts in a search hit DTO.
#[derive(Debug, Clone, Serialize)]
pub struct VotesDto {
    /// Total votes.
    pub total: i64,
    /// Votes for A.
    pub a: i64,
    /// Votes for B.
    pub b: i64,
    /// Tie votes.
    pub tie: i64,
}

/// One response inside a search hit DTO.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponseDto {
    /// Response id.
    pub response_id: i64,
    /// Provider label.
    pub provider: String,
    /// Model label.
    pub model: String,
    /// Response text.
    pub content: String,
}

/// One search hit mapped for API clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPairDto {
    /// Pair id.
    pub pair_id: i64,
    /// Prompt id.
    pub prompt_id: i64,
    /// Prompt title.
    pub title: String,
    /// Prompt body.
    pub prompt: String,
    /// Response A.
    pub a: SearchResponseDto,
    /// Response B.
    pub b: SearchResponseDto,
    /// Vote counts.
    pub votes: VotesDto,
    /// Contestedness score.
    pub disagreement_score: f64,
    /// Last rebuild time, RFC 3339.
    pub updated_at: String,
}

impl From<PairDoc> for SearchPairDto {
    fn from(doc: PairDoc) -> Self {
        // Ids are stored as keyword strings; a malformed id maps to zero
        // rather than failing the whole page.
        let parse = |s: &str| s.parse::<i64>().unwrap_or(0);
        Self {
            pair_id: parse(&doc.pair_id),
            prompt_id: parse(&doc.prompt_id),
            title: doc.prompt_title,
            prompt: doc.prompt_body,
            a: SearchResponseDto {
                response_id: parse(&doc.response_a_id),
                provider: doc.a_provider,
                model: doc.a_model,
                content: doc.a_content,
            },
            b: SearchResponseDto {
                response_id: parse(&doc.response_b_id),
                provider: doc.b_provider,
                model: doc.b_model,
                content: doc.b_content,
            },
            votes: VotesDto {
                total: doc.votes_total,
                a: doc.votes_a,
                b: doc.votes_b,
                tie: doc.votes_tie,
            },
            disagreement_score: doc.disagreement_score,
            updated_at: doc
                .updated_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        }
    }
}

// ============================================================================
// Sort modes and cursors
// ============================================================================

/// Result ordering for pair search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    /// Most contested first (homepage default).
    Disagreement,
    /// Most voted first.
    Votes,
    /// Most recently updated first.
    New,
    /// Text relevance; only meaningful with a query.
    Relevance,
}

impl SortMode {
    /// Resolves the sort parameter, defaulting to relevance when a query
    /// is present and disagreement otherwise. Unknown values fall back to
    /// the default.
    #[must_use]
    pub fn resolve(param: &str, query: &str) -> Self {
        match param {
            "votes" => Self::Votes,
            "new" => Self::New,
            "relevance" => Self::Relevance,
            "disagreement" => Self::Disagreement,
            _ => {
                if query.trim().is_empty() {
                    Self::Disagreement
                } else {
                    Self::Relevance
                }
            }
        }
    }

    fn sort_vector(self, query: &str) -> Vec<Value> {
        match self {
            Self::New => vec![
                json!({"updated_at": {"order": "desc"}}),
                json!({"pair_id": {"order": "desc"}}),
            ],
            Self::Votes => vec![
                json!({"votes_total": {"order": "desc"}}),
                json!({"disagreement_score": {"order": "desc"}}),
                json!({"pair_id": {"order": "desc"}}),
            ],
            Self::Relevance if !query.trim().is_empty() => vec![
                json!("_score"),
                json!({"disagreement_score": {"order": "desc"}}),
                json!({"votes_total": {"order": "desc"}}),
                json!({"pair_id": {"order": "desc"}}),
            ],
            // Relevance without a query falls back to disagreement.
            Self::Relevance => vec![
                json!({"disagreement_score": {"order": "desc"}}),
                json!({"votes_total": {"order": "desc"}}),
                json!({"pair_id": {"order": "desc"}}),
            ],
            Self::Disagreement => vec![
                json!({"disagreement_score": {"order": "desc"}}),
                json!({"votes_total": {"order": "desc"}}),
                json!({"updated_at": {"order": "desc"}}),
                json!({"pair_id": {"order": "desc"}}),
            ],
        }
    }
}

/// An opaque `search_after` cursor: the previous page's tail sort vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Sort vector of the last hit on the previous page.
    pub sort: Vec<Value>,
}

/// Encodes a cursor as unpadded base64url JSON.
#[must_use]
pub fn encode_cursor(cursor: &Cursor) -> String {
    // Serializing a {sort: [...]} value cannot fail.
    let bytes = serde_json::to_vec(cursor).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes a cursor produced by [`encode_cursor`].
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for anything that is not one of ours.
pub fn decode_cursor(encoded: &str) -> Result<Cursor> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| Error::InvalidInput(format!("bad cursor: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::InvalidInput(format!("bad cursor: {e}")))
}

// ============================================================================
// Client
// ============================================================================

/// Connection settings for the search index.
#[derive(Debug, Clone, Default)]
pub struct SearchClientConfig {
    /// Base URL, e.g. `https://localhost:9200`.
    pub url: String,
    /// Basic-auth username.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    /// Skip TLS verification (dev only).
    pub insecure: bool,
}

/// Minimal OpenSearch HTTP client.
#[derive(Debug, Clone)]
pub struct SearchClient {
    http: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl SearchClient {
    /// Creates a client from connection settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SearchIndex`] when the HTTP client cannot be built.
    pub fn new(config: SearchClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::search_index(format!("build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username,
            password: config.password,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.username {
            Some(username) => builder.basic_auth(username, self.password.as_deref()),
            None => builder,
        }
    }

    /// Returns whether an index exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SearchIndex`] on transport failure.
    pub async fn index_exists(&self, index: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::HEAD, &format!("/{index}"))
            .send()
            .await
            .map_err(|e| Error::search_index(format!("index exists: {e}")))?;
        Ok(response.status() == reqwest::StatusCode::OK)
    }

    /// Creates an index with the given settings + mappings body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SearchIndex`] on transport failure or a non-2xx
    /// response.
    pub async fn create_index(&self, index: &str, body: &Value) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/{index}"))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::search_index(format!("create index: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::search_index(format!(
                "create index failed status={status}"
            )));
        }
        Ok(())
    }

    /// Upserts one document by id. Repeated application with the same
    /// document yields the same final state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SearchIndex`] on transport failure or a non-2xx
    /// response.
    pub async fn index_doc(&self, index: &str, id: &str, doc: &Value) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/{index}/_doc/{id}"))
            .query(&[("refresh", "false")])
            .json(doc)
            .send()
            .await
            .map_err(|e| Error::search_index(format!("index doc: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::search_index(format!("index status={status}")));
        }
        Ok(())
    }

    /// Executes a search request and returns the raw response body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SearchIndex`] on transport failure or a non-2xx
    /// response.
    pub async fn search(&self, index: &str, body: &Value) -> Result<Value> {
        let response = self
            .request(reqwest::Method::POST, &format!("/{index}/_search"))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::search_index(format!("search: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::search_index(format!(
                "search status={status} body={}",
                body.trim()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::search_index(format!("decode search response: {e}")))
    }
}

/// Ensures the pairs index exists, creating it with the expected mapping.
///
/// # Errors
///
/// Returns [`Error::SearchIndex`] when the index can neither be found nor
/// created; callers treat that as a startup failure.
pub async fn ensure_pairs_index(client: &SearchClient, index: &str) -> Result<()> {
    if client.index_exists(index).await? {
        return Ok(());
    }
    client.create_index(index, &pairs_index_mapping()).await
}

/// Settings + mappings for the pairs index: identifiers and enumerated
/// tags as `keyword`, long text as `text`, counts as `integer`, the score
/// as `double`, timestamps as `date`.
#[must_use]
pub fn pairs_index_mapping() -> Value {
    json!({
        "settings": { "number_of_shards": 1, "number_of_replicas": 0 },
        "mappings": {
            "properties": {
                "pair_id": { "type": "keyword" },
                "prompt_id": { "type": "keyword" },
                "created_at": { "type": "date" },
                "updated_at": { "type": "date" },
                "visibility": { "type": "keyword" },

                "prompt_title": { "type": "text", "fields": { "keyword": { "type": "keyword", "ignore_above": 256 } } },
                "prompt_body": { "type": "text" },

                "response_a_id": { "type": "keyword" },
                "response_b_id": { "type": "keyword" },

                "a_provider": { "type": "keyword" },
                "a_model": { "type": "keyword" },
                "a_content": { "type": "text" },

                "b_provider": { "type": "keyword" },
                "b_model": { "type": "keyword" },
                "b_content": { "type": "text" },

                "votes_total": { "type": "integer" },
                "votes_a": { "type": "integer" },
                "votes_b": { "type": "integer" },
                "votes_tie": { "type": "integer" },
                "disagreement_score": { "type": "double" }
            }
        }
    })
}

// ============================================================================
// Service
// ============================================================================

/// Parameters for one pair search.
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    /// Free-text query; empty means browse.
    pub q: String,
    /// Visibility filter; empty defaults to `public`.
    pub visibility: String,
    /// Raw sort parameter; resolved via [`SortMode::resolve`].
    pub sort: String,
    /// Page size; clamped to `1..=100`, zero defaults to 20.
    pub limit: usize,
    /// Opaque cursor from the previous page.
    pub cursor: String,
}

/// One page of search results.
#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    /// Matching pairs.
    pub items: Vec<SearchPairDto>,
    /// Cursor for the next page, when one exists.
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct RawSearchResponse {
    #[serde(default)]
    hits: RawHits,
}

#[derive(Deserialize, Default)]
struct RawHits {
    #[serde(default)]
    hits: Vec<RawHit>,
}

#[derive(Deserialize)]
struct RawHit {
    #[serde(rename = "_source")]
    source: PairDoc,
    #[serde(default)]
    sort: Vec<Value>,
}

/// Pair search over the derived index.
#[derive(Debug, Clone)]
pub struct SearchService {
    client: SearchClient,
    index: String,
}

impl SearchService {
    /// Creates a service over the given client and index.
    #[must_use]
    pub fn new(client: SearchClient, index: impl Into<String>) -> Self {
        Self {
            client,
            index: index.into(),
        }
    }

    /// Runs one search and maps the hits for API clients.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] for a malformed cursor,
    /// [`Error::SearchIndex`] when the index call fails.
    pub async fn search_pairs(&self, params: SearchParams) -> Result<SearchPage> {
        let body = build_query(&params)?;
        let raw = self.client.search(&self.index, &body).await?;
        let response: RawSearchResponse = serde_json::from_value(raw)?;

        let mut items = Vec::with_capacity(response.hits.hits.len());
        let mut last_sort: Vec<Value> = Vec::new();
        for hit in response.hits.hits {
            items.push(SearchPairDto::from(hit.source));
            last_sort = hit.sort;
        }

        let next_cursor = if items.is_empty() || last_sort.is_empty() {
            None
        } else {
            Some(encode_cursor(&Cursor { sort: last_sort }))
        };

        Ok(SearchPage { items, next_cursor })
    }
}

/// Builds the search request body for the given parameters.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for a malformed cursor.
pub fn build_query(params: &SearchParams) -> Result<Value> {
    let limit = match params.limit {
        0 => DEFAULT_SEARCH_LIMIT,
        n => n.min(MAX_SEARCH_LIMIT),
    };
    let visibility = if params.visibility.is_empty() {
        "public"
    } else {
        &params.visibility
    };
    let query = params.q.trim();
    let sort = SortMode::resolve(&params.sort, query);

    let mut must: Vec<Value> = Vec::new();
    if !query.is_empty() {
        must.push(json!({
            "multi_match": {
                "query": query,
                "type": "best_fields",
                "operator": "and",
                "fields": [
                    "prompt_title^4",
                    "prompt_body^2",
                    "a_content",
                    "b_content",
                ],
            }
        }));
    }

    let mut body = json!({
        "size": limit,
        "_source": [
            "pair_id", "prompt_id", "visibility",
            "prompt_title", "prompt_body",
            "response_a_id", "response_b_id",
            "a_provider", "a_model", "a_content",
            "b_provider", "b_model", "b_content",
            "votes_total", "votes_a", "votes_b", "votes_tie",
            "disagreement_score", "updated_at",
        ],
        "query": {
            "bool": {
                "must": must,
                "filter": [
                    { "term": { "visibility": visibility } },
                ],
            }
        },
        "sort": sort.sort_vector(query),
    });

    if !params.cursor.is_empty() {
        let cursor = decode_cursor(&params.cursor)?;
        if !cursor.sort.is_empty() {
            body["search_after"] = Value::Array(cursor.sort);
        }
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_zero_without_ab_votes() {
        assert_eq!(disagreement_score(0, 0, 0), 0.0);
        assert_eq!(disagreement_score(0, 0, 10), 0.0);
    }

    #[test]
    fn test_score_peaks_at_even_split() {
        let even = disagreement_score(5, 5, 10);
        assert!((even - 11.0_f64.ln()).abs() < 1e-9);

        let skewed = disagreement_score(10, 0, 10);
        assert_eq!(skewed, 0.0);

        for a in 0..=10 {
            assert!(disagreement_score(a, 10 - a, 10) <= even + 1e-9);
        }
    }

    #[test]
    fn test_score_is_symmetric() {
        assert!((disagreement_score(7, 3, 12) - disagreement_score(3, 7, 12)).abs() < 1e-12);
        assert!((disagreement_score(1, 9, 10) - disagreement_score(9, 1, 10)).abs() < 1e-12);
    }

    #[test]
    fn test_cursor_round_trip() {
        let cursor = Cursor {
            sort: vec![json!(3.2), json!(17), json!("2024-01-01T00:00:00Z")],
        };
        let encoded = encode_cursor(&cursor);
        assert!(!encoded.contains('='));
        let decoded = decode_cursor(&encoded).expect("decode");
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(matches!(
            decode_cursor("not!base64"),
            Err(Error::InvalidInput(_))
        ));
        let valid_b64_bad_json = URL_SAFE_NO_PAD.encode(b"[1,2]");
        assert!(matches!(
            decode_cursor(&valid_b64_bad_json),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_sort_defaults_depend_on_query() {
        assert_eq!(SortMode::resolve("", ""), SortMode::Disagreement);
        assert_eq!(SortMode::resolve("", "rust"), SortMode::Relevance);
        assert_eq!(SortMode::resolve("votes", ""), SortMode::Votes);
        assert_eq!(SortMode::resolve("bogus", ""), SortMode::Disagreement);
    }

    #[test]
    fn test_build_query_clamps_limit_and_defaults_visibility() {
        let body = build_query(&SearchParams {
            limit: 1000,
            ..SearchParams::default()
        })
        .expect("build");
        assert_eq!(body["size"], 100);
        assert_eq!(
            body["query"]["bool"]["filter"][0]["term"]["visibility"],
            "public"
        );
        assert!(body.get("search_after").is_none());

        let body = build_query(&SearchParams::default()).expect("build");
        assert_eq!(body["size"], 20);
    }

    #[test]
    fn test_build_query_relevance_sort_leads_with_score() {
        let body = build_query(&SearchParams {
            q: "alignment".to_string(),
            ..SearchParams::default()
        })
        .expect("build");
        assert_eq!(body["sort"][0], "_score");
        assert_eq!(body["query"]["bool"]["must"][0]["multi_match"]["query"], "alignment");
    }

    #[test]
    fn test_build_query_carries_search_after() {
        let cursor = encode_cursor(&Cursor {
            sort: vec![json!(1.5), json!(42)],
        });
        let body = build_query(&SearchParams {
            cursor,
            ..SearchParams::default()
        })
        .expect("build");
        assert_eq!(body["search_after"], json!([1.5, 42]));
    }

    #[test]
    fn test_build_query_rejects_bad_cursor() {
        let result = build_query(&SearchParams {
            cursor: "///".to_string(),
            ..SearchParams::default()
        });
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_doc_maps_to_dto() {
        let doc = PairDoc {
            pair_id: "42".to_string(),
            prompt_id: "7".to_string(),
            visibility: "public".to_string(),
            prompt_title: "title".to_string(),
            prompt_body: "body".to_string(),
            response_a_id: "1".to_string(),
            response_b_id: "2".to_string(),
            a_provider: "openrouter".to_string(),
            a_model: "m-a".to_string(),
            a_content: "left".to_string(),
            b_provider: "openrouter".to_string(),
            b_model: "m-b".to_string(),
            b_content: "right".to_string(),
            votes_total: 10,
            votes_a: 5,
            votes_b: 5,
            votes_tie: 0,
            disagreement_score: 2.3979,
            ..PairDoc::default()
        };

        let dto = SearchPairDto::from(doc);
        assert_eq!(dto.pair_id, 42);
        assert_eq!(dto.prompt_id, 7);
        assert_eq!(dto.votes.total, 10);
        assert_eq!(dto.a.response_id, 1);
        assert_eq!(dto.b.model, "m-b");
    }

    #[test]
    fn test_mapping_types() {
        let mapping = pairs_index_mapping();
        let properties = &mapping["mappings"]["properties"];
        assert_eq!(properties["pair_id"]["type"], "keyword");
        assert_eq!(properties["prompt_body"]["type"], "text");
        assert_eq!(properties["votes_total"]["type"], "integer");
        assert_eq!(properties["disagreement_score"]["type"], "double");
        assert_eq!(properties["updated_at"]["type"], "date");
        assert_eq!(mapping["settings"]["number_of_shards"], 1);
        assert_eq!(mapping["settings"]["number_of_replicas"], 0);
    }
}
