//! # Memory Subsystem
//!
//! Fact upsert with conflict tracking, hashed bag-of-tokens vector indexing,
//! source trust EMA, causal edges, and lifecycle tiering.
//!
//! Claims are split out of event content on CJK/Latin sentence delimiters.
//! Each claim is reduced to a (subject, predicate, object) triplet; the SHA-1
//! of the normalized triplet is the claim key, and key collisions with
//! differing normalized text are the conflict detector.

use crate::error::Result;
use crate::util::{clamp, clip, now_iso, sha1_hex};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

pub const VECTOR_DIM: usize = 64;

static SENTENCE_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[。！？?!;\n]+").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w ]+").unwrap());
static TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9_\x{4e00}-\x{9fff}]+").unwrap());

const HEDGE_MARKERS: &[&str] = &["可能", "大概", "maybe", "perhaps"];

// ============================================================================
// Ingest
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryStats {
    pub facts: i64,
    pub vectors: i64,
    pub conflicts: i64,
    pub edges: i64,
}

/// Ingest one event into fact memory, vector memory, causal edges, and source
/// trust, then re-tier everything.
pub async fn ingest_event_memory(
    pool: &SqlitePool,
    event_id: i64,
    source: &str,
    content: &str,
    meta: &serde_json::Value,
) -> Result<MemoryStats> {
    let text = content.trim();
    if text.is_empty() {
        return Ok(MemoryStats::default());
    }

    let claims = extract_claims(text);
    let mut inserted = 0;
    for claim in claims.iter().take(24) {
        if upsert_fact(pool, event_id, source, claim, meta).await? {
            inserted += 1;
        }
    }

    let today_prefix = format!("{}%", &now_iso()[..10]);
    let conflicts: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM fact_conflicts WHERE source = ? AND ts LIKE ?",
    )
    .bind(source)
    .bind(&today_prefix)
    .fetch_one(pool)
    .await?;

    index_vector(pool, event_id, source, text).await?;
    let edges = upsert_causal_edges(pool, event_id, source, text).await?;
    update_source_trust(pool, source, source_quality(source)).await?;
    run_memory_lifecycle(pool).await?;

    Ok(MemoryStats {
        facts: inserted,
        vectors: 1,
        conflicts,
        edges,
    })
}

/// Split content into claim candidates: sentence-delimited, at least 6 chars,
/// truncated at 400.
pub fn extract_claims(text: &str) -> Vec<String> {
    SENTENCE_SPLIT
        .split(text)
        .map(|part| part.trim())
        .filter(|part| part.chars().count() >= 6)
        .map(|part| clip(part, 400).to_string())
        .collect()
}

/// Reduce a claim to a (subject, predicate, object) triplet via explicit
/// connectives, falling back to the first tokens.
pub fn split_claim_triplet(claim: &str) -> (String, String, String) {
    let s = claim.trim();
    if let Some((a, b)) = s.split_once("->") {
        return (
            clip(a.trim(), 80).to_string(),
            "leads_to".to_string(),
            clip(b.trim(), 200).to_string(),
        );
    }
    if let Some((a, b)) = s.split_once("导致") {
        return (
            clip(a.trim(), 80).to_string(),
            "causes".to_string(),
            clip(b.trim(), 200).to_string(),
        );
    }
    if s.contains("因为") && s.contains("所以") {
        if let Some((a, b)) = s.split_once("所以") {
            return (
                clip(a.replace("因为", "").trim(), 80).to_string(),
                "therefore".to_string(),
                clip(b.trim(), 200).to_string(),
            );
        }
    }
    if let Some((a, b)) = s.split_once('是') {
        return (
            clip(a.trim(), 80).to_string(),
            "is".to_string(),
            clip(b.trim(), 200).to_string(),
        );
    }
    let tokens = tokenize(s);
    if tokens.len() >= 3 {
        return (
            clip(&tokens[0], 80).to_string(),
            clip(&tokens[1], 32).to_string(),
            clip(&tokens[2..].join(" "), 200).to_string(),
        );
    }
    (clip(s, 80).to_string(), "states".to_string(), clip(s, 200).to_string())
}

/// Lowercase, collapse whitespace, strip everything but word chars and CJK,
/// truncate at 400.
pub fn normalize_claim(text: &str) -> String {
    let lowered = text.to_lowercase();
    let collapsed = WHITESPACE.replace_all(lowered.trim(), " ");
    let stripped = NON_WORD.replace_all(&collapsed, "");
    clip(&stripped, 400).to_string()
}

pub fn fact_key(subject: &str, predicate: &str, object_text: &str) -> String {
    sha1_hex(&format!(
        "{}|{}|{}",
        normalize_claim(subject),
        normalize_claim(predicate),
        normalize_claim(object_text)
    ))
}

/// Base 0.52, longer claims earn up to +0.18, hedged phrasing costs 0.08.
pub fn claim_confidence(claim: &str) -> f64 {
    let base = 0.52;
    let length_bonus = (claim.chars().count() as f64 / 500.0).min(0.18);
    let hedge_penalty = if HEDGE_MARKERS.iter().any(|m| claim.contains(m)) {
        0.08
    } else {
        0.0
    };
    clamp(base + length_bonus - hedge_penalty, 0.1, 0.95)
}

/// Confidence after conflicts: each conflict costs 0.05 up to 0.35 total,
/// floored at 0.1.
pub fn blend_confidence(confidence: f64, conflict_count: i64) -> f64 {
    let penalty = (conflict_count as f64 * 0.05).min(0.35);
    clamp(confidence - penalty, 0.1, 0.95)
}

/// Insert or update one fact. Returns true when a new row was inserted.
async fn upsert_fact(
    pool: &SqlitePool,
    event_id: i64,
    source: &str,
    claim: &str,
    meta: &serde_json::Value,
) -> Result<bool> {
    let ts = now_iso();
    let (subject, predicate, object_text) = split_claim_triplet(claim);
    let claim_key = fact_key(&subject, &predicate, &object_text);
    let confidence = claim_confidence(claim);

    let existing: Option<(i64, String, i64, i64)> = sqlx::query_as(
        "SELECT id, claim_text, support_count, conflict_count FROM fact_memory WHERE claim_key = ?",
    )
    .bind(&claim_key)
    .fetch_optional(pool)
    .await?;

    let Some((fact_id, existing_text, support_count, mut conflict_count)) = existing else {
        sqlx::query(
            r#"
            INSERT INTO fact_memory(
                claim_key, claim_text, subject, predicate, object_text, confidence,
                support_count, conflict_count, source, first_seen_event_id, last_seen_event_id,
                first_seen_ts, last_seen_ts, tier, lifecycle_score, meta_json
            ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, 1, 0, ?7, ?8, ?9, ?10, ?11, 'warm', 0.0, ?12)
            "#,
        )
        .bind(&claim_key)
        .bind(claim)
        .bind(&subject)
        .bind(&predicate)
        .bind(&object_text)
        .bind(confidence)
        .bind(source)
        .bind(event_id)
        .bind(event_id)
        .bind(&ts)
        .bind(&ts)
        .bind(meta.to_string())
        .execute(pool)
        .await?;
        return Ok(true);
    };

    if normalize_claim(&existing_text) != normalize_claim(claim) {
        sqlx::query(
            r#"
            INSERT INTO fact_conflicts(ts, claim_key, existing_fact_id, incoming_claim, existing_claim, source, note)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, 'same key but different text')
            "#,
        )
        .bind(&ts)
        .bind(&claim_key)
        .bind(fact_id)
        .bind(claim)
        .bind(&existing_text)
        .bind(source)
        .execute(pool)
        .await?;
        conflict_count += 1;
    }

    let new_confidence = blend_confidence(confidence, conflict_count);
    let kept_text = if claim.chars().count() >= existing_text.chars().count() {
        claim
    } else {
        existing_text.as_str()
    };
    sqlx::query(
        r#"
        UPDATE fact_memory
        SET claim_text = ?1, confidence = ?2, support_count = ?3, conflict_count = ?4,
            source = ?5, last_seen_event_id = ?6, last_seen_ts = ?7, meta_json = ?8
        WHERE claim_key = ?9
        "#,
    )
    .bind(kept_text)
    .bind(new_confidence)
    .bind(support_count + 1)
    .bind(conflict_count)
    .bind(source)
    .bind(event_id)
    .bind(&ts)
    .bind(meta.to_string())
    .bind(&claim_key)
    .execute(pool)
    .await?;
    Ok(false)
}

// ============================================================================
// Vectors
// ============================================================================

pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Deterministic hashed bag-of-tokens: MD5 each token, bucket by `hash % 64`,
/// sign from bit 1, then L2-normalize.
pub fn text_to_vector(text: &str) -> Vec<f64> {
    let mut vec = vec![0.0_f64; VECTOR_DIM];
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return vec;
    }
    for token in tokens {
        let digest = md5::compute(token.as_bytes());
        let hash = u128::from_be_bytes(digest.0);
        let idx = (hash % VECTOR_DIM as u128) as usize;
        let sign = if (hash >> 1) & 1 == 1 { -1.0 } else { 1.0 };
        vec[idx] += sign;
    }
    let norm = vec.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}

pub fn cosine(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

async fn index_vector(pool: &SqlitePool, event_id: i64, source: &str, content: &str) -> Result<()> {
    let vec = text_to_vector(content);
    let norm = vec.iter().map(|v| v * v).sum::<f64>().sqrt();
    sqlx::query(
        r#"
        INSERT INTO memory_vectors(event_id, source, content, vector_json, norm, tier, ts)
        VALUES(?1, ?2, ?3, ?4, ?5, 'short', ?6)
        "#,
    )
    .bind(event_id)
    .bind(source)
    .bind(clip(content, 2000))
    .bind(serde_json::to_string(&vec).unwrap_or_else(|_| "[]".to_string()))
    .bind(norm)
    .bind(now_iso())
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================================
// Causal edges
// ============================================================================

async fn upsert_causal_edges(
    pool: &SqlitePool,
    event_id: i64,
    source: &str,
    text: &str,
) -> Result<i64> {
    let mut count = 0;
    for line in extract_claims(text).iter().take(16) {
        let (subject, predicate, object_text) = if let Some((a, b)) = line.split_once("导致") {
            (clip(a.trim(), 120), "causes", clip(b.trim(), 180).to_string())
        } else if let Some((a, b)) = line.split_once("->") {
            (clip(a.trim(), 120), "leads_to", clip(b.trim(), 180).to_string())
        } else if line.contains("因为") && line.contains("所以") {
            let Some((a, b)) = line.split_once("所以") else { continue };
            let subject = a.replace("因为", "");
            let object = clip(b.trim(), 180).to_string();
            sqlx::query(
                r#"
                INSERT INTO causal_edges(subject, predicate, object_text, weight, source, last_event_id, updated_ts)
                VALUES(?1, 'therefore', ?2, 0.5, ?3, ?4, ?5)
                "#,
            )
            .bind(clip(subject.trim(), 120))
            .bind(object)
            .bind(source)
            .bind(event_id)
            .bind(now_iso())
            .execute(pool)
            .await?;
            count += 1;
            continue;
        } else {
            continue;
        };
        sqlx::query(
            r#"
            INSERT INTO causal_edges(subject, predicate, object_text, weight, source, last_event_id, updated_ts)
            VALUES(?1, ?2, ?3, 0.5, ?4, ?5, ?6)
            "#,
        )
        .bind(subject)
        .bind(predicate)
        .bind(object_text)
        .bind(source)
        .bind(event_id)
        .bind(now_iso())
        .execute(pool)
        .await?;
        count += 1;
    }
    Ok(count)
}

// ============================================================================
// Source trust
// ============================================================================

/// Baseline quality signal per source family.
pub fn source_quality(source: &str) -> f64 {
    let low = source.to_lowercase();
    if low.starts_with("manual") || low.starts_with("brain") || low.starts_with("deep-worker") || low.starts_with("health") {
        0.80
    } else if low.contains("web") {
        0.55
    } else if low.contains("social") {
        0.52
    } else if low.contains("device") {
        0.50
    } else {
        0.60
    }
}

/// EMA with alpha shrinking as samples accumulate: `1 / max(3, min(50, n+1))`.
pub async fn update_source_trust(pool: &SqlitePool, source: &str, quality_signal: f64) -> Result<()> {
    let ts = now_iso();
    let signal = clamp(quality_signal, 0.0, 1.0);
    let existing: Option<(f64, i64)> =
        sqlx::query_as("SELECT trust_score, sample_count FROM source_trust WHERE source = ?")
            .bind(source)
            .fetch_optional(pool)
            .await?;
    match existing {
        None => {
            sqlx::query(
                "INSERT INTO source_trust(source, trust_score, sample_count, updated_ts) VALUES(?1, ?2, 1, ?3)",
            )
            .bind(source)
            .bind(signal)
            .bind(&ts)
            .execute(pool)
            .await?;
        }
        Some((old, samples)) => {
            let alpha = 1.0 / clamp((samples + 1) as f64, 3.0, 50.0);
            let new = (1.0 - alpha) * old + alpha * signal;
            sqlx::query(
                "UPDATE source_trust SET trust_score = ?1, sample_count = ?2, updated_ts = ?3 WHERE source = ?4",
            )
            .bind(new)
            .bind(samples + 1)
            .bind(&ts)
            .bind(source)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

pub async fn source_trust_score(pool: &SqlitePool, source: &str, default: f64) -> Result<f64> {
    let score: Option<f64> = sqlx::query_scalar("SELECT trust_score FROM source_trust WHERE source = ? LIMIT 1")
        .bind(source)
        .fetch_optional(pool)
        .await?;
    Ok(score.unwrap_or(default))
}

// ============================================================================
// Lifecycle tiering
// ============================================================================

/// Re-tier vectors by age against the newest row id, and facts by
/// `support − 0.6·conflict − 0.002·age` against the newest seen event.
pub async fn run_memory_lifecycle(pool: &SqlitePool) -> Result<()> {
    let max_id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM memory_vectors")
        .fetch_one(pool)
        .await?;
    let Some(max_id) = max_id else { return Ok(()) };
    if max_id <= 0 {
        return Ok(());
    }

    let vector_ids: Vec<(i64,)> = sqlx::query_as("SELECT id FROM memory_vectors").fetch_all(pool).await?;
    for (id,) in vector_ids {
        let age = max_id - id;
        let tier = if age <= 30 {
            "short"
        } else if age <= 200 {
            "mid"
        } else if age <= 1200 {
            "long"
        } else {
            "crystal"
        };
        sqlx::query("UPDATE memory_vectors SET tier = ? WHERE id = ?")
            .bind(tier)
            .bind(id)
            .execute(pool)
            .await?;
    }

    let max_fact_event: Option<i64> =
        sqlx::query_scalar("SELECT MAX(last_seen_event_id) FROM fact_memory")
            .fetch_one(pool)
            .await?;
    let max_fact_event = max_fact_event.unwrap_or(0);
    let facts: Vec<(i64, i64, i64, i64)> =
        sqlx::query_as("SELECT id, support_count, conflict_count, last_seen_event_id FROM fact_memory")
            .fetch_all(pool)
            .await?;
    for (id, support, conflict, last_seen) in facts {
        let age = (max_fact_event - last_seen).max(0);
        let lifecycle = support as f64 - 0.6 * conflict as f64 - 0.002 * age as f64;
        let tier = if lifecycle >= 3.0 {
            "hot"
        } else if lifecycle >= 1.0 {
            "warm"
        } else if lifecycle >= -0.5 {
            "cold"
        } else {
            "archive"
        };
        sqlx::query("UPDATE fact_memory SET tier = ?, lifecycle_score = ? WHERE id = ?")
            .bind(tier)
            .bind(lifecycle)
            .bind(id)
            .execute(pool)
            .await?;
    }
    Ok(())
}

// ============================================================================
// Retrieval
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FactHit {
    pub id: i64,
    pub claim_text: String,
    pub confidence: f64,
    pub source: String,
    pub support_count: i64,
    pub conflict_count: i64,
    pub last_seen_event_id: i64,
    pub trust_score: f64,
    #[sqlx(default)]
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    pub id: i64,
    pub event_id: i64,
    pub source: String,
    pub content: String,
    pub tier: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Retrieved {
    pub facts: Vec<FactHit>,
    pub vectors: Vec<VectorHit>,
}

/// Fact-first retrieval over the last 800 non-archive facts:
/// `0.50·jaccard + 0.30·confidence + 0.20·trust`.
pub async fn fact_first_retrieve(pool: &SqlitePool, query: &str, top_k: usize) -> Result<Vec<FactHit>> {
    let q_tokens: std::collections::BTreeSet<String> = tokenize(query).into_iter().collect();
    let mut rows = sqlx::query_as::<_, FactHit>(
        r#"
        SELECT f.id, f.claim_text, f.confidence, f.support_count, f.conflict_count,
               f.source, f.last_seen_event_id, COALESCE(s.trust_score, 0.5) AS trust_score
        FROM fact_memory AS f
        LEFT JOIN source_trust AS s ON s.source = f.source
        WHERE f.tier IN ('hot', 'warm', 'cold')
        ORDER BY f.last_seen_event_id DESC
        LIMIT 800
        "#,
    )
    .fetch_all(pool)
    .await?;

    for hit in &mut rows {
        let claim_tokens: std::collections::BTreeSet<String> = tokenize(&hit.claim_text).into_iter().collect();
        let overlap = if q_tokens.is_empty() || claim_tokens.is_empty() {
            0.0
        } else {
            q_tokens.intersection(&claim_tokens).count() as f64 / q_tokens.len().max(1) as f64
        };
        hit.score = 0.50 * overlap + 0.30 * hit.confidence + 0.20 * hit.trust_score;
    }
    rows.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    rows.truncate(top_k.max(1));
    Ok(rows)
}

/// Cosine retrieval over the last 1000 non-archive vectors.
pub async fn vector_retrieve(pool: &SqlitePool, query: &str, top_k: usize) -> Result<Vec<VectorHit>> {
    let q = text_to_vector(query);
    let rows: Vec<(i64, i64, String, String, String)> = sqlx::query_as(
        r#"
        SELECT id, event_id, source, content, vector_json
        FROM memory_vectors
        WHERE tier IN ('short', 'mid', 'long', 'crystal')
        ORDER BY id DESC
        LIMIT 1000
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut scored: Vec<VectorHit> = rows
        .into_iter()
        .map(|(id, event_id, source, content, vector_json)| {
            let vec: Vec<f64> = serde_json::from_str(&vector_json).unwrap_or_default();
            let score = cosine(&q, &vec[..vec.len().min(VECTOR_DIM)]);
            VectorHit {
                id,
                event_id,
                source,
                content,
                tier: "short".to_string(),
                score,
            }
        })
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k.max(1));
    Ok(scored)
}

pub async fn hybrid_retrieve(pool: &SqlitePool, query: &str, top_k: usize) -> Result<Retrieved> {
    Ok(Retrieved {
        facts: fact_first_retrieve(pool, query, top_k).await?,
        vectors: vector_retrieve(pool, query, top_k).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_runtime_db;

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = connect_runtime_db(&dir.path().join("memory.db")).await.unwrap();
        (dir, pool)
    }

    #[test]
    fn test_extract_claims_filters_short_fragments() {
        let claims = extract_claims("ok。并发冲突正在上升，需要关注！no\nlatency is degrading fast");
        assert_eq!(claims.len(), 2);
        assert!(claims[0].contains("并发冲突"));
    }

    #[test]
    fn test_triplet_connectives() {
        let (s, p, o) = split_claim_triplet("cache miss -> slow responses");
        assert_eq!(p, "leads_to");
        assert_eq!(s, "cache miss");
        assert_eq!(o, "slow responses");

        let (_, p, _) = split_claim_triplet("高并发导致锁冲突");
        assert_eq!(p, "causes");

        let (s, p, o) = split_claim_triplet("因为内存不足所以触发回收");
        assert_eq!(p, "therefore");
        assert_eq!(s, "内存不足");
        assert_eq!(o, "触发回收");

        let (_, p, _) = split_claim_triplet("这是一个稳定的系统");
        assert_eq!(p, "is");
    }

    #[test]
    fn test_normalize_claim_strips_punctuation() {
        assert_eq!(normalize_claim("  Hello,   WORLD!  "), "hello world");
        assert_eq!(normalize_claim("并发冲突！"), "并发冲突");
    }

    #[test]
    fn test_claim_confidence_hedge_penalty() {
        let plain = claim_confidence("the cache is saturated under load");
        let hedged = claim_confidence("the cache is maybe saturated under load");
        assert!(hedged < plain);
        assert!((plain - hedged - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_blend_confidence_monotone_and_clamped() {
        let base = 0.7;
        let one = blend_confidence(base, 1);
        let five = blend_confidence(base, 5);
        let fifty = blend_confidence(base, 50);
        assert!(one < base);
        assert!(five < one);
        // Penalty caps at 0.35.
        assert!((fifty - (base - 0.35)).abs() < 1e-9);
        assert!(blend_confidence(0.12, 10) >= 0.1);
    }

    #[test]
    fn test_text_to_vector_is_normalized_and_deterministic() {
        let v1 = text_to_vector("latency spike in shard seven");
        let v2 = text_to_vector("latency spike in shard seven");
        assert_eq!(v1, v2);
        let norm: f64 = v1.iter().map(|x| x * x).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9);
        assert!((cosine(&v1, &v2) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_text_vector_is_zero() {
        let v = text_to_vector("!!!");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_source_quality_table() {
        assert_eq!(source_quality("manual"), 0.80);
        assert_eq!(source_quality("deep-worker"), 0.80);
        assert_eq!(source_quality("web_probe"), 0.55);
        assert_eq!(source_quality("social"), 0.52);
        assert_eq!(source_quality("device_capture"), 0.50);
        assert_eq!(source_quality("panel"), 0.60);
    }

    #[tokio::test]
    async fn test_same_key_different_text_raises_conflict() {
        let (_dir, pool) = test_pool().await;
        // Both claims reduce to the triplet (缓存, is, 瓶颈核心模块) and thus
        // the same claim key, but their normalized full text differs by the
        // interior spaces, which is exactly the conflict detector.
        ingest_event_memory(&pool, 1, "manual", "缓存 是 瓶颈核心模块", &serde_json::json!({}))
            .await
            .unwrap();
        let before: (f64, i64) =
            sqlx::query_as("SELECT confidence, conflict_count FROM fact_memory LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(before.1, 0);

        ingest_event_memory(&pool, 2, "manual", "缓存是瓶颈核心模块", &serde_json::json!({}))
            .await
            .unwrap();
        let facts: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM fact_memory")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(facts, 1, "same key must update in place, not insert");

        let after: (f64, i64) =
            sqlx::query_as("SELECT confidence, conflict_count FROM fact_memory LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(after.1, before.1 + 1);
        assert!(after.0 < before.0, "conflict must strictly lower confidence");

        let conflicts: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM fact_conflicts")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(conflicts, 1);
    }

    #[tokio::test]
    async fn test_ingest_writes_vector_edge_and_trust() {
        let (_dir, pool) = test_pool().await;
        let stats = ingest_event_memory(
            &pool,
            1,
            "manual",
            "高并发导致锁冲突，需要限流。缓存压力上升很快",
            &serde_json::json!({}),
        )
        .await
        .unwrap();
        assert_eq!(stats.vectors, 1);
        assert!(stats.facts >= 1);
        assert_eq!(stats.edges, 1);

        let trust = source_trust_score(&pool, "manual", 0.6).await.unwrap();
        assert!((trust - 0.80).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_trust_ema_converges() {
        let (_dir, pool) = test_pool().await;
        update_source_trust(&pool, "web_probe", 0.55).await.unwrap();
        for _ in 0..10 {
            update_source_trust(&pool, "web_probe", 0.55).await.unwrap();
        }
        let trust = source_trust_score(&pool, "web_probe", 0.6).await.unwrap();
        assert!((trust - 0.55).abs() < 0.01);
        let samples: i64 = sqlx::query_scalar("SELECT sample_count FROM source_trust WHERE source = 'web_probe'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(samples, 11);
    }

    #[tokio::test]
    async fn test_hybrid_retrieve_ranks_matching_fact_first() {
        let (_dir, pool) = test_pool().await;
        ingest_event_memory(&pool, 1, "manual", "并发风险上升需要回落策略", &serde_json::json!({}))
            .await
            .unwrap();
        ingest_event_memory(&pool, 2, "manual", "天气很好适合户外散步啊", &serde_json::json!({}))
            .await
            .unwrap();

        let retrieved = hybrid_retrieve(&pool, "并发风险", 4).await.unwrap();
        assert!(!retrieved.facts.is_empty());
        assert!(retrieved.facts[0].claim_text.contains("并发"));
        assert!(!retrieved.vectors.is_empty());
    }

    #[tokio::test]
    async fn test_support_count_bumps_on_repeat() {
        let (_dir, pool) = test_pool().await;
        ingest_event_memory(&pool, 1, "manual", "队列深度是关键指标之一", &serde_json::json!({}))
            .await
            .unwrap();
        ingest_event_memory(&pool, 2, "manual", "队列深度是关键指标之一", &serde_json::json!({}))
            .await
            .unwrap();
        let (support, last_seen): (i64, i64) =
            sqlx::query_as("SELECT support_count, last_seen_event_id FROM fact_memory LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(support, 2);
        assert_eq!(last_seen, 2);
    }
}
