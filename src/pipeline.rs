//! Stage orchestration: exact dedup → signatures → LSH + clustering →
//! representative selection → write.
//!
//! Each stage boundary is checkpointed when a [`CheckpointStore`] is
//! attached. The near-duplicate stages keep per-document metadata and
//! signatures only; texts are re-read from the (restartable) source by the
//! passes that need them.

use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::algo::checkpoint::{self, CheckpointMeta, CheckpointStore, Stage};
use crate::algo::exact::{self, Digest, ExactFilter, PartitionedDigestSet};
use crate::algo::lines::{LineCounter, LineStats};
use crate::algo::lsh::{CandidatePair, LshBucketer};
use crate::algo::minhash::{self, MinHasher, Signature};
use crate::algo::normalize;
use crate::algo::select::{self, DocMeta};
use crate::algo::shingle::{self, Shingler};
use crate::algo::union_find::{self, UnionFind};
use crate::config::{DedupConfig, ExecutionMode, VerifyMode};
use crate::error::{DedupError, Result};
use crate::record::{
    Document, DocumentSink, DocumentSource, MemorySource, Positioned, RawRecord, RecordIter,
    VecSink,
};

const BATCH: usize = 8192;

/// Removal statistics for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    /// Valid documents read.
    pub documents_in: usize,
    pub malformed_skipped: usize,
    pub exact_duplicates_removed: usize,
    /// Clusters with two or more members.
    pub near_duplicate_clusters: usize,
    pub near_duplicate_documents_removed: usize,
    pub documents_out: usize,
    pub candidate_pairs: usize,
    /// Candidates refused by verification.
    pub pairs_rejected: usize,
    pub oversized_buckets: usize,
    pub pairs_skipped_by_cap: u64,
}

/// A near-duplicate cluster, by document id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterReport {
    pub representative: String,
    /// All member ids in input order, representative included.
    pub members: Vec<String>,
}

/// Everything decided before the write pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupPlan {
    pub stats: DedupStats,
    /// Multi-member clusters only.
    pub clusters: Vec<ClusterReport>,
    /// Source positions of the surviving documents, ascending.
    pub keep: Vec<u64>,
    /// Stages loaded from checkpoints instead of recomputed.
    pub resumed: Vec<Stage>,
}

// ── Stage payloads (checkpointed) ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExactOutput {
    survivors: Vec<DocMeta>,
    documents_in: usize,
    malformed: usize,
    exact_duplicates: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClusterOutput {
    forest: UnionFind,
    candidate_pairs: usize,
    pairs_rejected: usize,
    oversized_buckets: usize,
    pairs_skipped: u64,
}

trait StageOutput: Serialize + DeserializeOwned {
    fn doc_count(&self) -> usize;
}

impl StageOutput for ExactOutput {
    fn doc_count(&self) -> usize {
        self.survivors.len()
    }
}

impl StageOutput for Vec<Signature> {
    fn doc_count(&self) -> usize {
        self.len()
    }
}

impl StageOutput for ClusterOutput {
    fn doc_count(&self) -> usize {
        self.forest.len()
    }
}

// ── Source scanning ──────────────────────────────────────────────────────────

/// Walks a source, numbering records and skipping malformed ones. A fatal
/// read error ends the walk and is reported by `finish`.
struct Scan<'s> {
    inner: RecordIter<'s>,
    seq: u64,
    malformed: usize,
    error: Option<DedupError>,
}

impl<'s> Scan<'s> {
    fn open(source: &'s dyn DocumentSource) -> Result<Self> {
        Ok(Self {
            inner: source.open()?,
            seq: 0,
            malformed: 0,
            error: None,
        })
    }

    fn finish(self) -> Result<usize> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.malformed),
        }
    }
}

impl Iterator for Scan<'_> {
    type Item = Positioned;

    fn next(&mut self) -> Option<Positioned> {
        loop {
            let seq = self.seq;
            match self.inner.next()? {
                Err(e) => {
                    self.error = Some(e);
                    return None;
                }
                Ok(RawRecord::Malformed(err)) => {
                    self.seq += 1;
                    self.malformed += 1;
                    warn!(seq, error = %err, "skipping malformed record");
                }
                Ok(RawRecord::Valid(doc)) => {
                    self.seq += 1;
                    return Some(Positioned { seq, doc });
                }
            }
        }
    }
}

/// Yields only the documents at the given ascending positions.
fn select_positions<'a, I>(scan: I, positions: &'a [u64]) -> impl Iterator<Item = Positioned> + 'a
where
    I: Iterator<Item = Positioned> + 'a,
{
    let mut cursor = 0;
    scan.filter(move |p| {
        while cursor < positions.len() && positions[cursor] < p.seq {
            cursor += 1;
        }
        cursor < positions.len() && positions[cursor] == p.seq
    })
}

fn next_batch<I: Iterator<Item = Positioned>>(it: &mut I) -> Vec<Positioned> {
    it.by_ref().take(BATCH).collect()
}

// ── Sketching ────────────────────────────────────────────────────────────────

/// Shingler + MinHash + banding, all derived from one config.
#[derive(Debug, Clone)]
pub struct Sketcher {
    shingler: Shingler,
    minhasher: MinHasher,
    bucketer: LshBucketer,
}

impl Sketcher {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            shingler: Shingler::new(config.shingle_width, config.normalize, config.random_seed),
            minhasher: MinHasher::new(config.num_hash_functions, config.random_seed),
            bucketer: LshBucketer::new(
                config.num_bands,
                config.rows_per_band,
                config.max_bucket_size,
                config.random_seed,
            ),
        }
    }

    pub fn shingles(&self, text: &str) -> HashSet<u64> {
        self.shingler.shingles(text)
    }

    pub fn signature(&self, text: &str) -> Signature {
        self.minhasher.signature(&self.shingler.shingles(text))
    }

    pub fn band_keys(&self, signature: &[u64]) -> Vec<u64> {
        self.bucketer.band_keys(signature)
    }

    pub fn bucketer(&self) -> &LshBucketer {
        &self.bucketer
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

pub struct Pipeline<'a> {
    config: DedupConfig,
    sketcher: Sketcher,
    store: Option<&'a dyn CheckpointStore>,
}

struct RunKey {
    fingerprint: u64,
    config_hash: u64,
}

impl<'a> Pipeline<'a> {
    /// Build a pipeline; resolves automatic `(b, r)` and validates.
    pub fn new(config: DedupConfig) -> Result<Self> {
        let config = config.resolved()?;
        let sketcher = Sketcher::new(&config);
        Ok(Self {
            config,
            sketcher,
            store: None,
        })
    }

    /// Checkpoint stage outputs to `store` and resume from it.
    pub fn with_checkpoints(mut self, store: &'a dyn CheckpointStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    pub fn sketcher(&self) -> &Sketcher {
        &self.sketcher
    }

    /// Decide which documents survive, without writing anything.
    pub fn plan(&self, source: &dyn DocumentSource) -> Result<DedupPlan> {
        let key = RunKey {
            fingerprint: source.fingerprint()?,
            config_hash: checkpoint::config_hash(&self.config),
        };
        let mut resumed = Vec::new();

        let exact = self.stage(Stage::Exact, &key, &mut resumed, || self.exact_stage(source))?;
        union_find::index_space(exact.survivors.len())?;
        let signatures = self.stage(Stage::Signatures, &key, &mut resumed, || {
            self.signature_stage(source, &exact.survivors)
        })?;
        if signatures.len() != exact.survivors.len() {
            return Err(DedupError::Checkpoint(format!(
                "signature count {} does not match {} exact-stage survivors",
                signatures.len(),
                exact.survivors.len()
            )));
        }
        let mut clustered = self.stage(Stage::Clusters, &key, &mut resumed, || {
            self.cluster_stage(source, &exact.survivors, &signatures)
        })?;

        Ok(self.select(&exact, &mut clustered, resumed))
    }

    /// Plan, then stream the survivors into `sink` and commit it.
    pub fn run(&self, source: &dyn DocumentSource, sink: Box<dyn DocumentSink + '_>) -> Result<DedupPlan> {
        let plan = self.plan(source)?;
        self.write(source, &plan, sink)?;
        Ok(plan)
    }

    /// Second pass over the source: emit kept documents in input order.
    /// The sink is committed only if every planned document was written.
    pub fn write(
        &self,
        source: &dyn DocumentSource,
        plan: &DedupPlan,
        mut sink: Box<dyn DocumentSink + '_>,
    ) -> Result<()> {
        let mut scan = Scan::open(source)?;
        let mut written = 0;
        for p in select_positions(&mut scan, &plan.keep) {
            sink.write(&p.doc)?;
            written += 1;
        }
        scan.finish()?;
        if written != plan.keep.len() {
            return Err(DedupError::Checkpoint(format!(
                "source changed: wrote {written} of {} planned documents",
                plan.keep.len()
            )));
        }
        sink.commit()?;
        info!(documents_out = written, "corpus written");
        Ok(())
    }

    fn stage<T, F>(&self, stage: Stage, key: &RunKey, resumed: &mut Vec<Stage>, compute: F) -> Result<T>
    where
        T: StageOutput,
        F: FnOnce() -> Result<T>,
    {
        if let Some(store) = self.store {
            if let Some(done) = checkpoint::load::<T>(store, stage, key.fingerprint, key.config_hash)? {
                info!(stage = stage.as_str(), docs = done.doc_count(), "resumed from checkpoint");
                resumed.push(stage);
                return Ok(done);
            }
        }
        let out = compute()?;
        if let Some(store) = self.store {
            let meta = CheckpointMeta::new(key.fingerprint, out.doc_count(), key.config_hash);
            checkpoint::save(store, stage, &meta, &out)?;
            debug!(stage = stage.as_str(), "checkpoint saved");
        }
        Ok(out)
    }

    // ── Stage 1: exact duplicates ───────────────────────────────────────────

    fn exact_stage(&self, source: &dyn DocumentSource) -> Result<ExactOutput> {
        let mut scan = Scan::open(source)?;
        let mut survivors = Vec::new();
        let mut documents_in = 0;

        let exact_duplicates = match self.config.execution {
            ExecutionMode::InMemory => {
                let filter = ExactFilter::new(self.config.normalize, self.config.digest_bits);
                let mut stream = filter.filter(scan.by_ref().inspect(|_| documents_in += 1));
                for p in stream.by_ref() {
                    survivors.push(meta_of(&p));
                }
                stream.duplicates()
            }
            ExecutionMode::Sharded { shards } => {
                let mut digests = PartitionedDigestSet::new(shards);
                let mut duplicates = 0;
                loop {
                    let batch = next_batch(&mut scan);
                    if batch.is_empty() {
                        break;
                    }
                    documents_in += batch.len();
                    let batch_digests: Vec<Digest> = batch
                        .par_iter()
                        .map(|p| {
                            let norm = normalize::normalize(&p.doc.text, &self.config.normalize);
                            exact::digest(&norm, self.config.digest_bits)
                        })
                        .collect();
                    let admitted = digests.admit_batch(&batch_digests);
                    for (p, ok) in batch.iter().zip(admitted) {
                        if ok {
                            survivors.push(meta_of(p));
                        } else {
                            duplicates += 1;
                        }
                    }
                }
                duplicates
            }
        };
        let malformed = scan.finish()?;

        info!(
            documents_in,
            malformed,
            exact_duplicates,
            survivors = survivors.len(),
            "exact-duplicate stage done"
        );
        Ok(ExactOutput {
            survivors,
            documents_in,
            malformed,
            exact_duplicates,
        })
    }

    // ── Stage 2: signatures ─────────────────────────────────────────────────

    fn signature_stage(&self, source: &dyn DocumentSource, survivors: &[DocMeta]) -> Result<Vec<Signature>> {
        let positions: Vec<u64> = survivors.iter().map(|m| m.seq).collect();
        let mut scan = Scan::open(source)?;
        let mut signatures = Vec::with_capacity(survivors.len());
        {
            let mut docs = select_positions(&mut scan, &positions);
            loop {
                let batch = next_batch(&mut docs);
                if batch.is_empty() {
                    break;
                }
                signatures.par_extend(batch.par_iter().map(|p| self.sketcher.signature(&p.doc.text)));
            }
        }
        scan.finish()?;
        if signatures.len() != survivors.len() {
            return Err(DedupError::Checkpoint(format!(
                "source changed: found {} of {} exact-stage survivors",
                signatures.len(),
                survivors.len()
            )));
        }
        info!(signatures = signatures.len(), k = self.config.num_hash_functions, "signature stage done");
        Ok(signatures)
    }

    // ── Stage 3: bucketing + clustering ─────────────────────────────────────

    fn cluster_stage(
        &self,
        source: &dyn DocumentSource,
        survivors: &[DocMeta],
        signatures: &[Signature],
    ) -> Result<ClusterOutput> {
        let report = self.sketcher.bucketer.candidate_pairs(signatures)?;
        let candidate_pairs = report.pairs.len();

        let accepted = match self.config.verify {
            VerifyMode::None => report.pairs,
            VerifyMode::Signature => {
                let threshold = self.config.similarity_threshold;
                report
                    .pairs
                    .into_par_iter()
                    .filter(|&(a, b)| {
                        minhash::jaccard(&signatures[a as usize], &signatures[b as usize])
                            .map(|j| j >= threshold)
                            .unwrap_or(false)
                    })
                    .collect()
            }
            VerifyMode::Shingles => self.verify_shingles(source, survivors, report.pairs)?,
        };
        let pairs_rejected = candidate_pairs - accepted.len();

        let forest = match self.config.execution {
            ExecutionMode::InMemory => {
                let mut forest = UnionFind::new(survivors.len())?;
                for &(a, b) in &accepted {
                    forest.union(a, b);
                }
                forest
            }
            ExecutionMode::Sharded { shards } => sharded_union(survivors.len(), &accepted, shards)?,
        };

        info!(
            candidate_pairs,
            accepted = accepted.len(),
            pairs_rejected,
            oversized_buckets = report.oversized_buckets,
            "clustering stage done"
        );
        Ok(ClusterOutput {
            forest,
            candidate_pairs,
            pairs_rejected,
            oversized_buckets: report.oversized_buckets,
            pairs_skipped: report.pairs_skipped,
        })
    }

    /// Keep only pairs whose exact shingle-set Jaccard reaches the threshold.
    /// Re-reads the source for documents that appear in any pair.
    fn verify_shingles(
        &self,
        source: &dyn DocumentSource,
        survivors: &[DocMeta],
        pairs: Vec<CandidatePair>,
    ) -> Result<Vec<CandidatePair>> {
        if pairs.is_empty() {
            return Ok(pairs);
        }
        let mut involved: Vec<u32> = pairs.iter().flat_map(|&(a, b)| [a, b]).collect();
        involved.sort_unstable();
        involved.dedup();
        let positions: Vec<u64> = involved.iter().map(|&i| survivors[i as usize].seq).collect();
        let index_of: HashMap<u64, u32> = involved
            .iter()
            .map(|&i| (survivors[i as usize].seq, i))
            .collect();

        let mut shingles: HashMap<u32, HashSet<u64>> = HashMap::with_capacity(involved.len());
        let mut scan = Scan::open(source)?;
        {
            let mut docs = select_positions(&mut scan, &positions);
            loop {
                let batch = next_batch(&mut docs);
                if batch.is_empty() {
                    break;
                }
                let sets: Vec<(u32, HashSet<u64>)> = batch
                    .par_iter()
                    .map(|p| (index_of[&p.seq], self.sketcher.shingles(&p.doc.text)))
                    .collect();
                shingles.extend(sets);
            }
        }
        scan.finish()?;
        if shingles.len() != involved.len() {
            return Err(DedupError::Checkpoint(
                "source changed: candidate documents missing during verification".into(),
            ));
        }

        let threshold = self.config.similarity_threshold;
        Ok(pairs
            .into_par_iter()
            .filter(|(a, b)| shingle::jaccard(&shingles[a], &shingles[b]) >= threshold)
            .collect())
    }

    // ── Stage 4: representatives ────────────────────────────────────────────

    fn select(&self, exact: &ExactOutput, clustered: &mut ClusterOutput, resumed: Vec<Stage>) -> DedupPlan {
        let policy = self.config.representative_policy;
        let clusters = clustered.forest.clusters();
        let keep_flags = select::keep_flags(&clusters, &exact.survivors, policy);

        let keep: Vec<u64> = exact
            .survivors
            .iter()
            .zip(&keep_flags)
            .filter(|(_, &k)| k)
            .map(|(m, _)| m.seq)
            .collect();

        let reports: Vec<ClusterReport> = clusters
            .iter()
            .filter(|c| c.members.len() > 1)
            .map(|c| ClusterReport {
                representative: exact.survivors[select::representative(c, &exact.survivors, policy) as usize]
                    .id
                    .clone(),
                members: c
                    .members
                    .iter()
                    .map(|&i| exact.survivors[i as usize].id.clone())
                    .collect(),
            })
            .collect();

        let near_removed = exact.survivors.len() - keep.len();
        let stats = DedupStats {
            documents_in: exact.documents_in,
            malformed_skipped: exact.malformed,
            exact_duplicates_removed: exact.exact_duplicates,
            near_duplicate_clusters: reports.len(),
            near_duplicate_documents_removed: near_removed,
            documents_out: keep.len(),
            candidate_pairs: clustered.candidate_pairs,
            pairs_rejected: clustered.pairs_rejected,
            oversized_buckets: clustered.oversized_buckets,
            pairs_skipped_by_cap: clustered.pairs_skipped,
        };
        info!(
            near_duplicate_clusters = stats.near_duplicate_clusters,
            near_removed,
            documents_out = stats.documents_out,
            policy = policy.as_str(),
            "representatives selected"
        );
        DedupPlan {
            stats,
            clusters: reports,
            keep,
            resumed,
        }
    }
}

fn meta_of(p: &Positioned) -> DocMeta {
    DocMeta {
        seq: p.seq,
        id: p.doc.id.clone(),
        chars: p.doc.text.chars().count(),
    }
}

/// Two-phase clustering: each shard unions its share of the pairs into a
/// local forest, then the local forests are merged.
fn sharded_union(n: usize, pairs: &[CandidatePair], shards: usize) -> Result<UnionFind> {
    let shards = shards.max(1);
    let mut routed: Vec<Vec<CandidatePair>> = vec![Vec::new(); shards];
    for &(a, b) in pairs {
        routed[a as usize % shards].push((a, b));
    }
    let locals: Vec<UnionFind> = routed
        .into_par_iter()
        .map(|shard_pairs| -> Result<UnionFind> {
            let mut local = UnionFind::new(n)?;
            for (a, b) in shard_pairs {
                local.union(a, b);
            }
            Ok(local)
        })
        .collect::<Result<_>>()?;

    let mut global = UnionFind::new(n)?;
    for local in &locals {
        global.merge(local);
    }
    Ok(global)
}

/// Deduplicate an in-memory batch of documents.
pub fn dedup_documents(docs: Vec<Document>, config: DedupConfig) -> Result<(Vec<Document>, DedupPlan)> {
    let pipeline = Pipeline::new(config)?;
    let source = MemorySource::from_documents(docs);
    let mut out = VecSink::default();
    let plan = pipeline.run(&source, Box::new(&mut out))?;
    Ok((out.docs, plan))
}

/// Corpus-wide line dedup: one pass to count lines, a second to rewrite
/// every document without its repeated lines.
pub fn dedup_lines(source: &dyn DocumentSource, mut sink: Box<dyn DocumentSink + '_>) -> Result<LineStats> {
    let mut counter = LineCounter::new();
    let mut scan = Scan::open(source)?;
    for p in scan.by_ref() {
        counter.observe(&p.doc.text);
    }
    scan.finish()?;

    let mut removed = 0;
    let mut scan = Scan::open(source)?;
    for p in scan.by_ref() {
        let (text, dropped) = counter.rewrite(&p.doc.text);
        removed += dropped;
        sink.write(&Document::new(p.doc.id, text))?;
    }
    scan.finish()?;
    sink.commit()?;

    let stats = LineStats {
        lines_in: counter.lines_seen(),
        lines_removed: removed,
    };
    info!(lines_in = stats.lines_in, lines_removed = stats.lines_removed, "line dedup done");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordError;

    fn cfg() -> DedupConfig {
        DedupConfig {
            shingle_width: 3,
            ..Default::default()
        }
    }

    #[test]
    fn select_positions_filters_in_order() {
        let docs: Vec<Positioned> = (0..6)
            .map(|i| Positioned {
                seq: i,
                doc: Document::new(i.to_string(), ""),
            })
            .collect();
        let got: Vec<u64> = select_positions(docs.into_iter(), &[1, 4, 5]).map(|p| p.seq).collect();
        assert_eq!(got, vec![1, 4, 5]);
    }

    #[test]
    fn scan_counts_malformed_and_keeps_positions() {
        let source = MemorySource::new(vec![
            RawRecord::Valid(Document::new("a", "x")),
            RawRecord::Malformed(RecordError::MissingId("id".into())),
            RawRecord::Valid(Document::new("b", "y")),
        ]);
        let mut scan = Scan::open(&source).unwrap();
        let seqs: Vec<u64> = scan.by_ref().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![0, 2]);
        assert_eq!(scan.finish().unwrap(), 1);
    }

    #[test]
    fn sharded_union_matches_single_forest() {
        let pairs = vec![(0, 1), (2, 3), (1, 2), (5, 6), (7, 9)];
        let mut single = UnionFind::new(10).unwrap();
        for &(a, b) in &pairs {
            single.union(a, b);
        }
        for shards in [1, 2, 3, 7] {
            let mut sharded = sharded_union(10, &pairs, shards).unwrap();
            let members = |uf: &mut UnionFind| -> Vec<Vec<u32>> {
                uf.clusters().into_iter().map(|c| c.members).collect()
            };
            assert_eq!(members(&mut sharded), members(&mut single));
        }
    }

    #[test]
    fn sketcher_signature_length() {
        let s = Sketcher::new(&cfg());
        assert_eq!(s.signature("a b c d e").len(), 128);
        assert_eq!(s.band_keys(&s.signature("a b c")).len(), 16);
    }

    #[test]
    fn line_dedup_drops_boilerplate() {
        let source = MemorySource::from_documents(vec![
            Document::new("a", "Cookie notice\nreal content one"),
            Document::new("b", "Cookie notice\nreal content two\n"),
        ]);
        let mut out = VecSink::default();
        let stats = {
            let sink: Box<dyn DocumentSink + '_> = Box::new(&mut out);
            dedup_lines(&source, sink).unwrap()
        };
        assert_eq!(stats.lines_in, 4);
        assert_eq!(stats.lines_removed, 2);
        assert_eq!(out.docs[0].text, "real content one");
        assert_eq!(out.docs[1].text, "real content two\n");
    }

    #[test]
    fn exact_stage_counts() {
        let p = Pipeline::new(cfg()).unwrap();
        let source = MemorySource::from_documents(vec![
            Document::new("1", "same text"),
            Document::new("2", "SAME  text"),
            Document::new("3", "other"),
        ]);
        let out = p.exact_stage(&source).unwrap();
        assert_eq!(out.documents_in, 3);
        assert_eq!(out.exact_duplicates, 1);
        assert_eq!(out.survivors.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["1", "3"]);
    }
}
