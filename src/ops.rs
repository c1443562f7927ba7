//! Shared operation wrappers for all interfaces (CLI, MCP).
//!
//! Each `op_*` function is a synchronous wrapper around the pipeline or one
//! or more `algo` modules. Input and output are `serde_json::Value`, with no
//! dependency on rmcp or clap.
//!
//! With the `checkpoint` feature enabled, `op_dedup` accepts a
//! `checkpoint_path`; completed stages found there are not recomputed.

use serde_json::Value;

use crate::algo::{lsh, minhash, shingle};
use crate::config::DedupConfig;
use crate::pipeline::{self, Pipeline, Sketcher};
use crate::record::{self, MemorySource, RawRecord, RecordFields, VecSink};

#[cfg(feature = "checkpoint")]
use crate::algo::checkpoint::{CheckpointStore, Stage};
#[cfg(feature = "checkpoint")]
use crate::algo::storage;

// ── Helpers ──────────────────────────────────────────────────────────────────

fn resolve(config: DedupConfig) -> Result<DedupConfig, String> {
    config.resolved().map_err(|e| e.to_string())
}

// ── Operations ───────────────────────────────────────────────────────────────

/// Exact + near-duplicate removal over JSON rows.
///
/// Returns `{records, stats, clusters}`; `records` are the surviving input
/// rows, unchanged and in input order.
pub fn op_dedup(
    rows: &[Value],
    fields: &RecordFields,
    config: DedupConfig,
    #[cfg_attr(not(feature = "checkpoint"), allow(unused))] checkpoint_path: Option<&str>,
) -> Result<Value, String> {
    let pipeline = Pipeline::new(config).map_err(|e| e.to_string())?;
    let source = MemorySource::from_values(rows, fields);

    #[cfg(feature = "checkpoint")]
    let store = match checkpoint_path {
        Some(path) => Some(storage::SqliteStore::open_or_create(path).map_err(|e| e.to_string())?),
        None => None,
    };
    #[cfg(feature = "checkpoint")]
    let pipeline = match &store {
        Some(db) => pipeline.with_checkpoints(db),
        None => pipeline,
    };
    #[cfg(not(feature = "checkpoint"))]
    if checkpoint_path.is_some() {
        return Err("Checkpoint feature not enabled. Build with --features checkpoint".into());
    }

    let plan = pipeline.plan(&source).map_err(|e| e.to_string())?;
    let records: Vec<Value> = plan.keep.iter().map(|&seq| rows[seq as usize].clone()).collect();

    Ok(serde_json::json!({
        "records": records,
        "stats": plan.stats,
        "clusters": plan.clusters,
        "resumed": plan.resumed.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
    }))
}

/// Corpus-wide line dedup over JSON rows. Rows that are not valid records
/// pass through untouched.
pub fn op_dedup_lines(rows: &[Value], fields: &RecordFields) -> Result<Value, String> {
    let source = MemorySource::from_values(rows, fields);
    let mut out = VecSink::default();
    let stats = pipeline::dedup_lines(&source, Box::new(&mut out)).map_err(|e| e.to_string())?;

    let mut rewritten = out.docs.into_iter();
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let mut row = row.clone();
        if let RawRecord::Valid(_) = record::parse_value(&row, fields) {
            let doc = rewritten
                .next()
                .ok_or_else(|| "line dedup returned fewer documents than it read".to_string())?;
            if let Some(obj) = row.as_object_mut() {
                obj.insert(fields.text.clone(), Value::String(doc.text));
            }
        }
        records.push(row);
    }
    Ok(serde_json::json!({ "records": records, "stats": stats }))
}

/// MinHash signature and band keys of one text.
pub fn op_signature(text: &str, config: DedupConfig) -> Result<Value, String> {
    let config = resolve(config)?;
    let sketcher = Sketcher::new(&config);
    let shingles = sketcher.shingles(text);
    let signature = sketcher.signature(text);
    let band_keys = sketcher.band_keys(&signature);
    Ok(serde_json::json!({
        "shingles": shingles.len(),
        "num_perm": signature.len(),
        "signature": signature,
        "band_keys": band_keys,
    }))
}

/// Compare two texts: exact shingle Jaccard, the MinHash estimate, and
/// whether LSH would make them a candidate pair.
pub fn op_similarity(a: &str, b: &str, config: DedupConfig) -> Result<Value, String> {
    let config = resolve(config)?;
    let sketcher = Sketcher::new(&config);

    let exact = shingle::jaccard(&sketcher.shingles(a), &sketcher.shingles(b));
    let sig_a = sketcher.signature(a);
    let sig_b = sketcher.signature(b);
    let estimated = minhash::jaccard(&sig_a, &sig_b).map_err(|e| e.to_string())?;
    let candidate = sketcher
        .band_keys(&sig_a)
        .iter()
        .zip(sketcher.band_keys(&sig_b))
        .any(|(x, y)| *x == y);

    Ok(serde_json::json!({
        "exact": exact,
        "estimated": estimated,
        "candidate": candidate,
        "near_duplicate": estimated >= config.similarity_threshold,
        "collision_probability": lsh::collision_probability(exact, config.num_bands, config.rows_per_band),
    }))
}

/// S-curve of a banding scheme. `bands`/`rows` of 0 pick the split of
/// `num_perm` that best fits `threshold`.
pub fn op_scurve(
    bands: usize,
    rows: usize,
    num_perm: usize,
    threshold: f64,
    steps: usize,
) -> Result<Value, String> {
    let (bands, rows) = if bands == 0 || rows == 0 {
        if num_perm == 0 {
            return Err("num_perm must be > 0 when bands/rows are automatic".into());
        }
        lsh::optimal_bands(num_perm, threshold)
    } else {
        (bands, rows)
    };
    let table: Vec<Value> = lsh::scurve_table(bands, rows, steps)
        .into_iter()
        .map(|(s, p)| serde_json::json!({ "similarity": s, "probability": p }))
        .collect();
    Ok(serde_json::json!({
        "bands": bands,
        "rows": rows,
        "num_perm": bands * rows,
        "threshold": lsh::scurve_threshold(bands, rows),
        "curve": table,
    }))
}

// ── Checkpoint management operations ─────────────────────────────────────────

/// Return info about a checkpoint database.
pub fn op_checkpoint_info(
    #[cfg_attr(not(feature = "checkpoint"), allow(unused))] path: &str,
) -> Result<Value, String> {
    #[cfg(feature = "checkpoint")]
    {
        let db = storage::SqliteStore::open_or_create(path).map_err(|e| e.to_string())?;
        let checkpoints = db.info().map_err(|e| e.to_string())?;
        let size = db.db_size_bytes().map_err(|e| e.to_string())?;
        return Ok(serde_json::json!({
            "path": path,
            "size_bytes": size,
            "total": checkpoints.len(),
            "checkpoints": checkpoints,
        }));
    }

    #[cfg(not(feature = "checkpoint"))]
    Err("Checkpoint feature not enabled. Build with --features checkpoint".into())
}

/// Clear checkpoints for one stage, or all of them.
pub fn op_checkpoint_clear(
    #[cfg_attr(not(feature = "checkpoint"), allow(unused))] path: &str,
    #[cfg_attr(not(feature = "checkpoint"), allow(unused))] stage: Option<&str>,
) -> Result<Value, String> {
    #[cfg(feature = "checkpoint")]
    {
        let db = storage::SqliteStore::open_or_create(path).map_err(|e| e.to_string())?;
        let stage_filter = match stage {
            Some(s) => Some(
                Stage::from_str(s)
                    .ok_or_else(|| format!("Unknown stage '{s}'. Use: exact, signatures, clusters"))?,
            ),
            None => None,
        };
        let deleted = db.invalidate(stage_filter).map_err(|e| e.to_string())?;
        return Ok(serde_json::json!({
            "path": path,
            "deleted": deleted,
            "stage": stage.unwrap_or("all"),
        }));
    }

    #[cfg(not(feature = "checkpoint"))]
    Err("Checkpoint feature not enabled. Build with --features checkpoint".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small() -> DedupConfig {
        DedupConfig {
            shingle_width: 3,
            ..Default::default()
        }
    }

    #[test]
    fn dedup_keeps_original_rows() {
        let rows = vec![
            json!({"id": 1, "text": "alpha beta gamma delta", "url": "a"}),
            json!({"id": 2, "text": "Alpha  beta gamma delta", "url": "b"}),
            json!({"text": "no id"}),
        ];
        let out = op_dedup(&rows, &RecordFields::default(), small(), None).unwrap();
        let records = out["records"].as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["url"], "a");
        assert_eq!(out["stats"]["exact_duplicates_removed"], 1);
        assert_eq!(out["stats"]["malformed_skipped"], 1);
    }

    #[test]
    fn dedup_lines_rewrites_text() {
        let rows = vec![
            json!({"id": "a", "text": "menu\nbody a"}),
            json!({"id": "b", "text": "menu\nbody b"}),
            json!({"id": "c"}),
        ];
        let out = op_dedup_lines(&rows, &RecordFields::default()).unwrap();
        assert_eq!(out["records"][0]["text"], "body a");
        assert_eq!(out["records"][1]["text"], "body b");
        assert_eq!(out["records"][2], json!({"id": "c"}));
        assert_eq!(out["stats"]["lines_removed"], 2);
    }

    #[test]
    fn dedup_lines_matches_pipeline_line_dedup() {
        let rows = vec![
            json!({"id": "a", "text": "header\nfirst\n\nfooter"}),
            json!({"id": "b", "text": "header\nsecond\nfooter"}),
            json!({"id": "c", "text": "third"}),
        ];
        let out = op_dedup_lines(&rows, &RecordFields::default()).unwrap();

        let source = MemorySource::from_values(&rows, &RecordFields::default());
        let mut sink = VecSink::default();
        let stats = pipeline::dedup_lines(&source, Box::new(&mut sink)).unwrap();
        let texts: Vec<&str> = sink.docs.iter().map(|d| d.text.as_str()).collect();
        let op_texts: Vec<&str> = out["records"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["text"].as_str().unwrap())
            .collect();
        assert_eq!(op_texts, texts);
        assert_eq!(out["stats"], serde_json::to_value(stats).unwrap());
    }

    #[test]
    fn signature_shape() {
        let out = op_signature("one two three four", small()).unwrap();
        assert_eq!(out["num_perm"], 128);
        assert_eq!(out["signature"].as_array().unwrap().len(), 128);
        assert_eq!(out["band_keys"].as_array().unwrap().len(), 16);
        assert_eq!(out["shingles"], 2);
    }

    #[test]
    fn similarity_identical_texts() {
        let out = op_similarity("the cat sat on the mat", "the cat sat on the mat", small()).unwrap();
        assert_eq!(out["exact"], 1.0);
        assert_eq!(out["estimated"], 1.0);
        assert_eq!(out["candidate"], true);
    }

    #[test]
    fn similarity_rejects_bad_config() {
        let bad = DedupConfig {
            num_bands: 7,
            rows_per_band: 7,
            ..Default::default()
        };
        assert!(op_similarity("a", "b", bad).is_err());
    }

    #[test]
    fn scurve_auto_and_explicit() {
        let out = op_scurve(16, 8, 0, 0.8, 10).unwrap();
        assert_eq!(out["curve"].as_array().unwrap().len(), 11);
        assert_eq!(out["num_perm"], 128);

        let auto = op_scurve(0, 0, 128, 0.5, 4).unwrap();
        assert_eq!(auto["num_perm"], 128);
        assert!(op_scurve(0, 0, 0, 0.5, 4).is_err());
    }

    #[cfg(not(feature = "checkpoint"))]
    #[test]
    fn checkpoint_ops_need_feature() {
        assert!(op_checkpoint_info("x.db").is_err());
        assert!(op_dedup(&[], &RecordFields::default(), small(), Some("x.db")).is_err());
    }
}
