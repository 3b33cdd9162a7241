//! The datum view (C5): list/inspect datums, synthesizing from the datum
//! factory when a job has no stats commit yet, or reconstructing from the
//! stats commit's on-disk layout once one does.

use std::sync::Arc;

use rayon::prelude::*;
use sha2::{Digest, Sha256};

use crate::cafs::CafsClient;
use crate::config::concurrency::DATUM_DETAIL_FETCH;
use crate::models::pipeline::Input;
use crate::prelude::*;

/// Computes the individual datums a given input tree would produce.
///
/// A `Union`'s datums are the concatenation of its children's datums (each
/// one processed on its own); a `Cross`'s datums are the cartesian product
/// of its children's datums (every combination crossed together forms one
/// datum). This is external to the control plane in a real deployment —
/// the factory that actually walks repo contents lives with the worker
/// pool — so this trait is the seam, matching how `cafs`/`cor` are trait
/// seams onto other external systems.
pub trait DatumFactory: Send + Sync {
    /// Enumerate every datum this input tree would produce. Each entry is
    /// the ordered set of `"name:path"` file references making up that
    /// datum's inputs.
    fn enumerate(&self, input: &Input) -> Result<Vec<Vec<String>>>;
}

/// The reference [`DatumFactory`], resolving Atom globs against CAFS.
pub struct CafsDatumFactory {
    cafs: Arc<dyn CafsClient>,
}

impl CafsDatumFactory {
    /// Build a datum factory backed by `cafs`.
    pub fn new(cafs: Arc<dyn CafsClient>) -> Self {
        CafsDatumFactory { cafs }
    }

    fn resolve_commit(
        &self,
        repo: &str,
        branch: Option<&str>,
        commit_id: Option<&str>,
    ) -> Result<String> {
        if let Some(id) = commit_id {
            return Ok(id.to_owned());
        }
        let branch = branch.unwrap_or("master");
        self.cafs.branch_head(repo, branch)?.ok_or_else(|| {
            CoreError::Validation {
                message: format!("repo {:?} branch {:?} has no commits yet", repo, branch),
            }
            .into()
        })
    }
}

impl DatumFactory for CafsDatumFactory {
    fn enumerate(&self, input: &Input) -> Result<Vec<Vec<String>>> {
        match input {
            Input::Atom {
                name,
                repo,
                branch,
                glob,
                commit_id,
            } => {
                let commit = self.resolve_commit(repo, branch.as_deref(), commit_id.as_deref())?;
                let label = name.as_deref().unwrap_or(repo.as_str());
                let files = self.cafs.glob_files(&commit, glob)?;
                Ok(files
                    .into_iter()
                    .map(|path| vec![format!("{}:{}", label, path)])
                    .collect())
            }
            Input::Cron { name, repo, .. } => {
                let repo = repo.as_deref().unwrap_or_default();
                let label = name.as_deref().unwrap_or("cron");
                Ok(match self.cafs.branch_head(repo, "master")? {
                    Some(commit) => vec![vec![format!("{}:{}", label, commit)]],
                    None => Vec::new(),
                })
            }
            Input::Git { name, branch, .. } => {
                let label = name.as_deref().unwrap_or("git");
                let branch = branch.as_deref().unwrap_or("master");
                Ok(match self.cafs.branch_head(label, branch)? {
                    Some(commit) => vec![vec![format!("{}:{}", label, commit)]],
                    None => Vec::new(),
                })
            }
            Input::Union(children) => {
                let mut out = Vec::new();
                for child in children {
                    out.extend(self.enumerate(child)?);
                }
                Ok(out)
            }
            Input::Cross(children) => {
                let mut product: Vec<Vec<String>> = vec![Vec::new()];
                for child in children {
                    let child_datums = self.enumerate(child)?;
                    let mut next = Vec::with_capacity(product.len() * child_datums.len().max(1));
                    for existing in &product {
                        for datum in &child_datums {
                            let mut combined = existing.clone();
                            combined.extend(datum.clone());
                            next.push(combined);
                        }
                    }
                    product = next;
                }
                Ok(product)
            }
        }
    }
}

/// A content hash of a datum's input file set, stable across jobs that see
/// the same inputs.
fn hash_input_files(files: &[String]) -> String {
    let mut sorted: Vec<&String> = files.iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for f in sorted {
        hasher.update(f.as_bytes());
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

/// Pagination bounds for a page of `N` items: `pageSize <= 0` means
/// "return everything"; otherwise `[page*pageSize, min((page+1)*pageSize, N))`,
/// failing if `page` is out of range.
fn page_bounds(total: usize, page: i64, page_size: i64) -> Result<(usize, usize)> {
    if page_size <= 0 {
        return Ok((0, total));
    }
    let page_size = page_size as usize;
    let page = page.max(0) as usize;
    let start = page * page_size;
    if start >= total && total > 0 {
        return Err(Error::msg("requested page is past the end of the datum stream"));
    }
    let end = ((page + 1) * page_size).min(total);
    Ok((start, end))
}

/// The datum view. Bundles CAFS and a datum factory.
pub struct DatumView {
    cafs: Arc<dyn CafsClient>,
    factory: Arc<dyn DatumFactory>,
}

/// The three aggregate artifacts present at the top level of a stats
/// commit, excluded from per-datum enumeration.
const AGGREGATE_SIBLINGS: &[&str] = &["stats", "logs", "pfs"];

impl DatumView {
    /// Build a datum view backed by `cafs` and `factory`.
    pub fn new(cafs: Arc<dyn CafsClient>, factory: Arc<dyn DatumFactory>) -> Self {
        DatumView { cafs, factory }
    }

    /// List a page of `job`'s datums.
    #[tracing::instrument(skip(self, job), level = "debug")]
    pub fn list(&self, job: &JobInfo, page: i64, page_size: i64) -> Result<Vec<DatumInfo>> {
        match &job.stats_commit {
            None => self.list_synthesized(job, page, page_size),
            Some(stats_commit) => self.list_from_stats(job, stats_commit, page, page_size),
        }
    }

    fn list_synthesized(&self, job: &JobInfo, page: i64, page_size: i64) -> Result<Vec<DatumInfo>> {
        let entries = self.factory.enumerate(&job.input)?;
        let (start, end) = page_bounds(entries.len(), page, page_size)?;
        Ok(entries[start..end]
            .iter()
            .map(|files| DatumInfo {
                datum_id: hash_input_files(files),
                job_id: job.id,
                outcome: DatumOutcome::Success, // placeholder; a still-starting job has no real outcome yet
                finished_at: None,
            })
            .collect())
    }

    fn list_from_stats(
        &self,
        job: &JobInfo,
        stats_commit: &str,
        page: i64,
        page_size: i64,
    ) -> Result<Vec<DatumInfo>> {
        let mut datum_ids = self.cafs.list_files(stats_commit, "/")?;
        datum_ids.retain(|id| !AGGREGATE_SIBLINGS.contains(&id.as_str()));

        let mut infos: Vec<DatumInfo> = datum_ids
            .par_iter()
            .map(|datum_id| self.classify(job, stats_commit, datum_id))
            .collect::<Result<Vec<_>>>()?;
        sort_datums(&mut infos);

        let (start, end) = page_bounds(infos.len(), page, page_size)?;
        Ok(infos[start..end].to_vec())
    }

    /// Derive a datum's outcome from its directory's contents: a
    /// `job:<id>` child naming a different job means this job's run of
    /// the datum was skipped (reused from a prior incremental pass); a
    /// `failure` child means it failed; otherwise it succeeded.
    fn classify(&self, job: &JobInfo, stats_commit: &str, datum_id: &str) -> Result<DatumInfo> {
        let dir = format!("/{}", datum_id);
        let children = self.cafs.list_files(stats_commit, &dir)?;

        let outcome = if children.iter().any(|c| c == "failure") {
            DatumOutcome::Failed
        } else if let Some(owning_job) = children
            .iter()
            .find_map(|c| c.strip_prefix("job:"))
            .filter(|id| *id != job.id.to_string())
        {
            tracing::trace!(datum_id, owning_job, "datum reused from a prior job");
            DatumOutcome::Skipped
        } else {
            DatumOutcome::Success
        };

        Ok(DatumInfo {
            datum_id: datum_id.to_owned(),
            job_id: job.id,
            outcome,
            finished_at: job.finished_at,
        })
    }

    /// Fetch the full detail for every datum in `infos`, bounded to
    /// `DATUM_DETAIL_FETCH` concurrent CAFS calls.
    #[tracing::instrument(skip(self, job, infos), level = "debug")]
    pub fn details(&self, job: &JobInfo, infos: &[DatumInfo]) -> Result<Vec<DatumDetail>> {
        let stats_commit = job
            .stats_commit
            .as_deref()
            .ok_or_else(|| Error::msg("job has no stats commit"))?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(DATUM_DETAIL_FETCH.min(infos.len().max(1)))
            .build()
            .context("could not build datum-detail thread pool")?;
        pool.install(|| {
            infos
                .par_iter()
                .map(|info| self.inspect(job, stats_commit, &info.datum_id))
                .collect()
        })
    }

    /// Inspect a single datum. Requires the job's
    /// stats commit to exist.
    #[tracing::instrument(skip(self, job), level = "debug")]
    pub fn inspect(&self, job: &JobInfo, stats_commit: &str, datum_id: &str) -> Result<DatumDetail> {
        let job_glob = format!("{}/job:*", datum_id);
        let matches = self.cafs.glob_files(stats_commit, &job_glob)?;
        let job_marker = match matches.as_slice() {
            [single] => single,
            [] => {
                return Err(CoreError::Invariant {
                    message: format!("datum {:?} has no job marker", datum_id),
                }
                .into())
            }
            _ => {
                return Err(CoreError::Invariant {
                    message: format!("datum {:?} has more than one job marker", datum_id),
                }
                .into())
            }
        };
        let owning_job = job_marker
            .rsplit("job:")
            .next()
            .ok_or_else(|| CoreError::Invariant {
                message: format!("malformed job marker {:?}", job_marker),
            })?;
        if owning_job != job.id.to_string() {
            return Err(CoreError::Invariant {
                message: format!(
                    "datum {:?}'s job marker {:?} does not match the requested job {}",
                    datum_id, owning_job, job.id,
                ),
            }
            .into());
        }

        let failure_path = format!("/{}/failure", datum_id);
        let error_message = match self.cafs.get_file(stats_commit, &failure_path) {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(_) => None,
        };
        let outcome = if error_message.is_some() {
            DatumOutcome::Failed
        } else {
            DatumOutcome::Success
        };

        let stats_path = format!("/{}/stats", datum_id);
        let (node_name, pod_name) = match self.cafs.get_file(stats_commit, &stats_path) {
            Ok(bytes) => {
                let stats: serde_json::Value =
                    serde_json::from_slice(&bytes).context("could not parse datum stats")?;
                (
                    stats.get("nodeName").and_then(|v| v.as_str()).map(str::to_owned),
                    stats.get("podName").and_then(|v| v.as_str()).map(str::to_owned),
                )
            }
            Err(_) => (None, None),
        };

        let index_path = format!("/{}/index", datum_id);
        let index: usize = match self.cafs.get_file(stats_commit, &index_path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes)
                .trim()
                .parse()
                .context("could not parse datum index")?,
            Err(_) => 0,
        };
        let entries = self.factory.enumerate(&job.input)?;
        let input_files = entries.get(index).cloned().unwrap_or_default();

        Ok(DatumDetail {
            info: DatumInfo {
                datum_id: datum_id.to_owned(),
                job_id: job.id,
                outcome,
                finished_at: job.finished_at,
            },
            input_files,
            error_message,
            node_name,
            pod_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cafs::InMemoryCafs;

    #[test]
    fn page_bounds_splits_evenly_and_rejects_overrun() {
        assert_eq!(page_bounds(10, 0, 3).unwrap(), (0, 3));
        assert_eq!(page_bounds(10, 3, 3).unwrap(), (9, 10));
        assert!(page_bounds(10, 4, 3).is_err());
        assert_eq!(page_bounds(10, 0, 0).unwrap(), (0, 10));
    }

    #[test]
    fn cross_product_combines_every_child_datum() {
        let cafs = Arc::new(InMemoryCafs::new());
        cafs.create_repo("a").unwrap();
        cafs.create_repo("b").unwrap();
        cafs.create_branch("a", "master").unwrap();
        cafs.create_branch("b", "master").unwrap();
        let ca = cafs.start_commit("a", "master").unwrap();
        cafs.put_file(&ca, "/1.txt", b"x").unwrap();
        cafs.put_file(&ca, "/2.txt", b"x").unwrap();
        cafs.finish_commit(&ca).unwrap();
        let cb = cafs.start_commit("b", "master").unwrap();
        cafs.put_file(&cb, "/only.txt", b"x").unwrap();
        cafs.finish_commit(&cb).unwrap();

        let factory = CafsDatumFactory::new(cafs);
        let input = Input::Cross(vec![
            Input::Atom {
                name: Some("a".to_owned()),
                repo: "a".to_owned(),
                branch: Some("master".to_owned()),
                glob: "/*".to_owned(),
                commit_id: None,
            },
            Input::Atom {
                name: Some("b".to_owned()),
                repo: "b".to_owned(),
                branch: Some("master".to_owned()),
                glob: "/*".to_owned(),
                commit_id: None,
            },
        ]);
        let entries = factory.enumerate(&input).unwrap();
        assert_eq!(entries.len(), 2); // 2 files in a, 1 in b => 2*1
        for entry in &entries {
            assert_eq!(entry.len(), 2);
        }
    }

    #[test]
    fn union_concatenates_child_datums() {
        let cafs = Arc::new(InMemoryCafs::new());
        cafs.create_repo("a").unwrap();
        cafs.create_repo("b").unwrap();
        cafs.create_branch("a", "master").unwrap();
        cafs.create_branch("b", "master").unwrap();
        let ca = cafs.start_commit("a", "master").unwrap();
        cafs.put_file(&ca, "/1.txt", b"x").unwrap();
        cafs.finish_commit(&ca).unwrap();
        let cb = cafs.start_commit("b", "master").unwrap();
        cafs.put_file(&cb, "/2.txt", b"x").unwrap();
        cafs.put_file(&cb, "/3.txt", b"x").unwrap();
        cafs.finish_commit(&cb).unwrap();

        let factory = CafsDatumFactory::new(cafs);
        let input = Input::Union(vec![
            Input::Atom {
                name: Some("a".to_owned()),
                repo: "a".to_owned(),
                branch: Some("master".to_owned()),
                glob: "/*".to_owned(),
                commit_id: None,
            },
            Input::Atom {
                name: Some("b".to_owned()),
                repo: "b".to_owned(),
                branch: Some("master".to_owned()),
                glob: "/*".to_owned(),
                commit_id: None,
            },
        ]);
        let entries = factory.enumerate(&input).unwrap();
        assert_eq!(entries.len(), 3); // 1 + 2, not crossed
    }
}
