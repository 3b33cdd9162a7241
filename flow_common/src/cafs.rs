//! The content-addressed file system (CAFS) client interface.
//!
//! CAFS is explicitly out of scope to implement "for real" — it's a
//! separate service with its own repos, branches, commits, provenance,
//! tags, objects and hash-tree trees. This module defines the trait the
//! rest of the control plane talks to, plus a reference in-memory
//! implementation that's faithful enough to use as both documentation
//! and a test fixture.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use glob::Pattern;
use sha2::{Digest, Sha256};

use crate::prelude::*;

/// Metadata about a single commit, as returned by [`CafsClient::commit_metadata`].
#[derive(Clone, Debug)]
pub struct CommitMetadata {
    /// The commit's content-addressed id.
    pub id: String,
    /// The repo this commit belongs to.
    pub repo: String,
    /// The branch this commit was made on.
    pub branch: String,
    /// True until `finish_commit`/`finish_commit_with_empty_tree` is called.
    pub open: bool,
    /// When the commit was started.
    pub started_at: chrono::DateTime<Utc>,
    /// When the commit was finished, if it has been.
    pub finished_at: Option<chrono::DateTime<Utc>>,
    /// The hash of this commit's tree object.
    pub tree_hash: String,
    /// The provenance commits (e.g. the spec commit a job's output commit
    /// descends from).
    pub provenance: Vec<String>,
}

/// The external content-addressed file system.
///
/// All methods are synchronous, matching the rest of this crate's
/// Postgres-backed store (CAFS calls are assumed cheap relative to worker
/// I/O; long-running enumeration calls are the caller's job to bound, e.g.
/// via `rayon` scoped pools for GC).
pub trait CafsClient: Send + Sync {
    /// Return a handle to this same backing store acting as the holder
    /// of `token` rather than whatever identity it was constructed with.
    /// Used to switch to the PPS capability token before writing to or
    /// deleting from the spec repo, which ordinary callers have no
    /// access to.
    fn as_capability(&self, token: &str) -> Arc<dyn CafsClient>;

    /// Does `repo` exist?
    fn repo_exists(&self, repo: &str) -> Result<bool>;

    /// Create `repo`. Idempotent: does nothing if it already exists.
    fn create_repo(&self, repo: &str) -> Result<()>;

    /// Delete `repo` and everything in it.
    fn delete_repo(&self, repo: &str) -> Result<()>;

    /// List every repo.
    fn list_repos(&self) -> Result<Vec<String>>;

    /// Does `repo@branch` exist?
    fn branch_exists(&self, repo: &str, branch: &str) -> Result<bool>;

    /// Create `repo@branch` if it doesn't already exist.
    fn create_branch(&self, repo: &str, branch: &str) -> Result<()>;

    /// Delete `repo@branch`.
    fn delete_branch(&self, repo: &str, branch: &str) -> Result<()>;

    /// The current HEAD commit of `repo@branch`, if any commits exist.
    fn branch_head(&self, repo: &str, branch: &str) -> Result<Option<String>>;

    /// Set `repo@branch`'s provenance to exactly this set of upstream
    /// branches (each given as `"repo@branch"`).
    fn set_branch_provenance(
        &self,
        repo: &str,
        branch: &str,
        provenance: &[String],
    ) -> Result<()>;

    /// Clear `repo@branch`'s provenance (used by hard-stop).
    fn clear_branch_provenance(&self, repo: &str, branch: &str) -> Result<()> {
        self.set_branch_provenance(repo, branch, &[])
    }

    /// The full (transitive) provenance of `repo@branch`: every upstream
    /// branch, including indirect ones.
    fn branch_provenance(&self, repo: &str, branch: &str) -> Result<Vec<String>>;

    /// Start a new open commit on `repo@branch`, with an empty tree
    /// inherited from the parent (if any). Returns the new commit's id.
    fn start_commit(&self, repo: &str, branch: &str) -> Result<String>;

    /// Finish an open commit, sealing its tree.
    fn finish_commit(&self, commit_id: &str) -> Result<()>;

    /// Finish an open commit with an empty tree, discarding any files
    /// already staged. Used by hard-stop.
    fn finish_commit_with_empty_tree(&self, commit_id: &str) -> Result<()>;

    /// Is this commit still open?
    fn is_commit_open(&self, commit_id: &str) -> Result<bool>;

    /// Metadata for a single commit.
    fn commit_metadata(&self, commit_id: &str) -> Result<CommitMetadata>;

    /// Record that `commit_id` has `provenance` commit ids (typically the
    /// spec commit, recorded on an output commit at creation time).
    fn set_commit_provenance(&self, commit_id: &str, provenance: &[String]) -> Result<()>;

    /// All commits on `repo@branch`, newest first.
    fn list_commits(&self, repo: &str, branch: &str) -> Result<Vec<String>>;

    /// All commits across every repo and branch. Used by GC's
    /// mark-from-commits phase.
    fn list_all_commits(&self) -> Result<Vec<String>>;

    /// Write `contents` at `path` inside the (still-open) commit
    /// `commit_id`, replacing whatever was there.
    fn put_file(&self, commit_id: &str, path: &str, contents: &[u8]) -> Result<()>;

    /// Delete `path` inside the (still-open) commit `commit_id`. Tolerates
    /// the path not existing.
    fn delete_file(&self, commit_id: &str, path: &str) -> Result<()>;

    /// Read the full contents of `path` inside `commit_id`.
    fn get_file(&self, commit_id: &str, path: &str) -> Result<Vec<u8>>;

    /// List the immediate children of `dir` inside `commit_id`.
    fn list_files(&self, commit_id: &str, dir: &str) -> Result<Vec<String>>;

    /// List every path inside `commit_id` matching `pattern` (a glob).
    fn glob_files(&self, commit_id: &str, pattern: &str) -> Result<Vec<String>>;

    /// Every object hash reachable from `commit_id`'s tree: the tree
    /// object itself, plus every file object it references. Used by GC.
    fn tree_object_hashes(&self, commit_id: &str) -> Result<Vec<String>>;

    /// Every object hash in the store, live or not.
    fn list_objects(&self) -> Result<Vec<String>>;

    /// Delete the given objects (already confirmed dead by the caller).
    /// Returns the number actually deleted.
    fn delete_objects(&self, hashes: &[String]) -> Result<usize>;

    /// Create or update a tag pointing at `object_hash`.
    fn put_tag(&self, tag: &str, object_hash: &str) -> Result<()>;

    /// Resolve a tag to the object hash it points at.
    fn resolve_tag(&self, tag: &str) -> Result<String>;

    /// Every tag whose name starts with `prefix`.
    fn list_tags_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Every tag in the store.
    fn list_all_tags(&self) -> Result<Vec<String>>;

    /// Delete the given tags. Returns the number actually deleted.
    fn delete_tags(&self, tags: &[String]) -> Result<usize>;
}

fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[derive(Clone, Debug)]
struct Commit {
    id: String,
    repo: String,
    branch: String,
    open: bool,
    started_at: chrono::DateTime<Utc>,
    finished_at: Option<chrono::DateTime<Utc>>,
    files: HashMap<String, String>, // path -> object hash
    provenance: Vec<String>,
}

#[derive(Default)]
struct Branch {
    commits: Vec<String>, // oldest first
    provenance: Vec<String>,
}

#[derive(Default)]
struct Repo {
    branches: HashMap<String, Branch>,
}

#[derive(Default)]
struct State {
    repos: HashMap<String, Repo>,
    commits: HashMap<String, Commit>,
    objects: HashMap<String, Vec<u8>>,
    tags: HashMap<String, String>,
}

/// A reference, in-memory implementation of [`CafsClient`].
///
/// This is what tests use in place of a real CAFS deployment, and it's
/// also a usable (if unscalable) standalone mode for local development.
#[derive(Default)]
pub struct InMemoryCafs {
    state: Arc<Mutex<State>>,
}

impl InMemoryCafs {
    /// Create a new, empty in-memory CAFS.
    pub fn new() -> Self {
        InMemoryCafs::default()
    }

    fn not_found(what: &str) -> Error {
        Error::msg(format!("{} not found", what))
    }
}

impl CafsClient for InMemoryCafs {
    fn as_capability(&self, _token: &str) -> Arc<dyn CafsClient> {
        // The in-memory reference store has no real notion of separate
        // identities; it just hands back a handle sharing the same
        // state, which is all the control plane needs to exercise the
        // "switch to the admin token" code paths in tests.
        Arc::new(InMemoryCafs {
            state: Arc::clone(&self.state),
        })
    }

    fn repo_exists(&self, repo: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().repos.contains_key(repo))
    }

    fn create_repo(&self, repo: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .repos
            .entry(repo.to_owned())
            .or_default();
        Ok(())
    }

    fn delete_repo(&self, repo: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(r) = state.repos.remove(repo) {
            let commit_ids: Vec<String> = r
                .branches
                .values()
                .flat_map(|b| b.commits.iter().cloned())
                .collect();
            for id in commit_ids {
                state.commits.remove(&id);
            }
        }
        Ok(())
    }

    fn list_repos(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().repos.keys().cloned().collect())
    }

    fn branch_exists(&self, repo: &str, branch: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state
            .repos
            .get(repo)
            .map(|r| r.branches.contains_key(branch))
            .unwrap_or(false))
    }

    fn create_branch(&self, repo: &str, branch: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let r = state.repos.entry(repo.to_owned()).or_default();
        r.branches.entry(branch.to_owned()).or_default();
        Ok(())
    }

    fn delete_branch(&self, repo: &str, branch: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(r) = state.repos.get_mut(repo) {
            if let Some(b) = r.branches.remove(branch) {
                for id in b.commits {
                    state.commits.remove(&id);
                }
            }
        }
        Ok(())
    }

    fn branch_head(&self, repo: &str, branch: &str) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .repos
            .get(repo)
            .and_then(|r| r.branches.get(branch))
            .and_then(|b| b.commits.last().cloned()))
    }

    fn set_branch_provenance(
        &self,
        repo: &str,
        branch: &str,
        provenance: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let r = state.repos.entry(repo.to_owned()).or_default();
        let b = r.branches.entry(branch.to_owned()).or_default();
        b.provenance = provenance.to_vec();
        Ok(())
    }

    fn branch_provenance(&self, repo: &str, branch: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let direct = state
            .repos
            .get(repo)
            .and_then(|r| r.branches.get(branch))
            .map(|b| b.provenance.clone())
            .unwrap_or_default();
        drop(state);

        // Transitively expand: each entry in `direct` is `"repo@branch"`.
        let mut seen = std::collections::HashSet::new();
        let mut stack = direct;
        let mut all = Vec::new();
        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            all.push(next.clone());
            if let Some((r, b)) = next.split_once('@') {
                let state = self.state.lock().unwrap();
                if let Some(parents) = state
                    .repos
                    .get(r)
                    .and_then(|repo| repo.branches.get(b))
                    .map(|branch| branch.provenance.clone())
                {
                    drop(state);
                    stack.extend(parents);
                }
            }
        }
        Ok(all)
    }

    fn start_commit(&self, repo: &str, branch: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let parent_files = state
            .repos
            .get(repo)
            .and_then(|r| r.branches.get(branch))
            .and_then(|b| b.commits.last())
            .and_then(|id| state.commits.get(id))
            .map(|c| c.files.clone())
            .unwrap_or_default();

        let id = uuid::Uuid::new_v4().to_string();
        let commit = Commit {
            id: id.clone(),
            repo: repo.to_owned(),
            branch: branch.to_owned(),
            open: true,
            started_at: Utc::now(),
            finished_at: None,
            files: parent_files,
            provenance: Vec::new(),
        };
        state.commits.insert(id.clone(), commit);
        let r = state.repos.entry(repo.to_owned()).or_default();
        let b = r.branches.entry(branch.to_owned()).or_default();
        b.commits.push(id.clone());
        Ok(id)
    }

    fn finish_commit(&self, commit_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let commit = state
            .commits
            .get_mut(commit_id)
            .ok_or_else(|| Self::not_found("commit"))?;
        commit.open = false;
        commit.finished_at = Some(Utc::now());
        Ok(())
    }

    fn finish_commit_with_empty_tree(&self, commit_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let commit = state
            .commits
            .get_mut(commit_id)
            .ok_or_else(|| Self::not_found("commit"))?;
        commit.files.clear();
        commit.open = false;
        commit.finished_at = Some(Utc::now());
        Ok(())
    }

    fn is_commit_open(&self, commit_id: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state
            .commits
            .get(commit_id)
            .ok_or_else(|| Self::not_found("commit"))?
            .open)
    }

    fn commit_metadata(&self, commit_id: &str) -> Result<CommitMetadata> {
        let state = self.state.lock().unwrap();
        let commit = state
            .commits
            .get(commit_id)
            .ok_or_else(|| Self::not_found("commit"))?;
        Ok(CommitMetadata {
            id: commit.id.clone(),
            repo: commit.repo.clone(),
            branch: commit.branch.clone(),
            open: commit.open,
            started_at: commit.started_at,
            finished_at: commit.finished_at,
            tree_hash: tree_hash(&commit.files),
            provenance: commit.provenance.clone(),
        })
    }

    fn set_commit_provenance(&self, commit_id: &str, provenance: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let commit = state
            .commits
            .get_mut(commit_id)
            .ok_or_else(|| Self::not_found("commit"))?;
        commit.provenance = provenance.to_vec();
        Ok(())
    }

    fn list_commits(&self, repo: &str, branch: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut commits = state
            .repos
            .get(repo)
            .and_then(|r| r.branches.get(branch))
            .map(|b| b.commits.clone())
            .unwrap_or_default();
        commits.reverse(); // newest first
        Ok(commits)
    }

    fn list_all_commits(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().commits.keys().cloned().collect())
    }

    fn put_file(&self, commit_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        let hash = hash_bytes(contents);
        let mut state = self.state.lock().unwrap();
        state.objects.insert(hash.clone(), contents.to_vec());
        let commit = state
            .commits
            .get_mut(commit_id)
            .ok_or_else(|| Self::not_found("commit"))?;
        if !commit.open {
            return Err(Error::msg(format!("commit {} is already finished", commit_id)));
        }
        commit.files.insert(path.to_owned(), hash);
        Ok(())
    }

    fn delete_file(&self, commit_id: &str, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let commit = state
            .commits
            .get_mut(commit_id)
            .ok_or_else(|| Self::not_found("commit"))?;
        commit.files.remove(path);
        Ok(())
    }

    fn get_file(&self, commit_id: &str, path: &str) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let commit = state
            .commits
            .get(commit_id)
            .ok_or_else(|| Self::not_found("commit"))?;
        let hash = commit
            .files
            .get(path)
            .ok_or_else(|| Self::not_found(&format!("file {:?}", path)))?;
        state
            .objects
            .get(hash)
            .cloned()
            .ok_or_else(|| Self::not_found("object"))
    }

    fn list_files(&self, commit_id: &str, dir: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let commit = state
            .commits
            .get(commit_id)
            .ok_or_else(|| Self::not_found("commit"))?;
        let prefix = if dir.is_empty() || dir == "/" {
            String::new()
        } else {
            format!("{}/", dir.trim_matches('/'))
        };
        let mut children = std::collections::HashSet::new();
        for path in commit.files.keys() {
            let path = path.trim_start_matches('/');
            if let Some(rest) = path.strip_prefix(&prefix) {
                if !rest.is_empty() {
                    let first_segment = rest.split('/').next().unwrap_or(rest);
                    children.insert(first_segment.to_owned());
                }
            }
        }
        let mut out: Vec<String> = children.into_iter().collect();
        out.sort();
        Ok(out)
    }

    fn glob_files(&self, commit_id: &str, pattern: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let commit = state
            .commits
            .get(commit_id)
            .ok_or_else(|| Self::not_found("commit"))?;
        let glob_pattern = Pattern::new(pattern.trim_start_matches('/'))
            .map_err(|err| Error::msg(format!("invalid glob {:?}: {}", pattern, err)))?;
        let mut out: Vec<String> = commit
            .files
            .keys()
            .filter(|p| glob_pattern.matches(p.trim_start_matches('/')))
            .cloned()
            .collect();
        out.sort();
        Ok(out)
    }

    fn tree_object_hashes(&self, commit_id: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let commit = state
            .commits
            .get(commit_id)
            .ok_or_else(|| Self::not_found("commit"))?;
        let mut hashes: Vec<String> = vec![tree_hash(&commit.files)];
        hashes.extend(commit.files.values().cloned());
        Ok(hashes)
    }

    fn list_objects(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().objects.keys().cloned().collect())
    }

    fn delete_objects(&self, hashes: &[String]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        for hash in hashes {
            if state.objects.remove(hash).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn put_tag(&self, tag: &str, object_hash: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .tags
            .insert(tag.to_owned(), object_hash.to_owned());
        Ok(())
    }

    fn resolve_tag(&self, tag: &str) -> Result<String> {
        self.state
            .lock()
            .unwrap()
            .tags
            .get(tag)
            .cloned()
            .ok_or_else(|| Self::not_found("tag"))
    }

    fn list_tags_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tags
            .keys()
            .filter(|t| t.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn list_all_tags(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().tags.keys().cloned().collect())
    }

    fn delete_tags(&self, tags: &[String]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        for tag in tags {
            if state.tags.remove(tag).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Hash a commit's file tree into a single tree-object hash. Real CAFS
/// serializes this as a proper hash-tree blob; we just hash the sorted
/// `(path, object_hash)` pairs, which is sufficient for mark-and-sweep.
fn tree_hash(files: &HashMap<String, String>) -> String {
    let mut entries: Vec<(&String, &String)> = files.iter().collect();
    entries.sort();
    let mut hasher = Sha256::new();
    for (path, hash) in entries {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commits_inherit_parent_files_and_can_be_overwritten() {
        let cafs = InMemoryCafs::new();
        cafs.create_repo("repo").unwrap();
        cafs.create_branch("repo", "master").unwrap();

        let c1 = cafs.start_commit("repo", "master").unwrap();
        cafs.put_file(&c1, "/a.txt", b"hello").unwrap();
        cafs.finish_commit(&c1).unwrap();

        let c2 = cafs.start_commit("repo", "master").unwrap();
        assert_eq!(cafs.get_file(&c2, "/a.txt").unwrap(), b"hello");
        cafs.put_file(&c2, "/a.txt", b"world").unwrap();
        cafs.finish_commit(&c2).unwrap();

        assert_eq!(cafs.get_file(&c1, "/a.txt").unwrap(), b"hello");
        assert_eq!(cafs.get_file(&c2, "/a.txt").unwrap(), b"world");
    }

    #[test]
    fn delete_file_tolerates_missing_path() {
        let cafs = InMemoryCafs::new();
        cafs.create_repo("repo").unwrap();
        cafs.create_branch("repo", "master").unwrap();
        let c1 = cafs.start_commit("repo", "master").unwrap();
        assert!(cafs.delete_file(&c1, "/does-not-exist").is_ok());
    }

    #[test]
    fn provenance_is_transitive() {
        let cafs = InMemoryCafs::new();
        cafs.create_repo("a").unwrap();
        cafs.create_repo("b").unwrap();
        cafs.create_repo("c").unwrap();
        cafs.create_branch("a", "master").unwrap();
        cafs.create_branch("b", "master").unwrap();
        cafs.create_branch("c", "master").unwrap();
        cafs.set_branch_provenance("b", "master", &["a@master".to_owned()])
            .unwrap();
        cafs.set_branch_provenance("c", "master", &["b@master".to_owned()])
            .unwrap();
        let provenance = cafs.branch_provenance("c", "master").unwrap();
        assert!(provenance.contains(&"a@master".to_owned()));
        assert!(provenance.contains(&"b@master".to_owned()));
    }

    #[test]
    fn glob_matches_paths_under_a_directory() {
        let cafs = InMemoryCafs::new();
        cafs.create_repo("repo").unwrap();
        cafs.create_branch("repo", "master").unwrap();
        let c1 = cafs.start_commit("repo", "master").unwrap();
        cafs.put_file(&c1, "datum1/stats", b"{}").unwrap();
        cafs.put_file(&c1, "datum1/logs", b"log").unwrap();
        cafs.put_file(&c1, "stats", b"aggregate").unwrap();
        cafs.finish_commit(&c1).unwrap();

        let mut matches = cafs.glob_files(&c1, "*/logs").unwrap();
        matches.sort();
        assert_eq!(matches, vec!["datum1/logs".to_owned()]);
    }

    #[test]
    fn as_capability_shares_state_with_the_original_handle() {
        let cafs = InMemoryCafs::new();
        cafs.create_repo("repo").unwrap();
        let admin = cafs.as_capability("pps-token");
        assert!(admin.repo_exists("repo").unwrap());
        admin.create_repo("admin-only").unwrap();
        assert!(cafs.repo_exists("admin-only").unwrap());
    }

    #[test]
    fn tree_object_hashes_includes_file_objects() {
        let cafs = InMemoryCafs::new();
        cafs.create_repo("repo").unwrap();
        cafs.create_branch("repo", "master").unwrap();
        let c1 = cafs.start_commit("repo", "master").unwrap();
        cafs.put_file(&c1, "/a.txt", b"hello").unwrap();
        cafs.finish_commit(&c1).unwrap();

        let hashes = cafs.tree_object_hashes(&c1).unwrap();
        assert_eq!(hashes.len(), 2); // tree hash + one file object
        let file_hash = hash_bytes(b"hello");
        assert!(hashes.contains(&file_hash));
    }
}
