use std::path::{Path, PathBuf};

use git2::{ErrorCode, IndexAddOption, Oid, Repository, Signature};

use crate::{clog_debug, clog_warn, Error, Result};

const COMMITTER_NAME: &str = "conductor";
const COMMITTER_EMAIL: &str = "conductor@localhost";

/// Git operations for a run: the run branch, its worktree and the
/// incremental commits made on it.
///
/// Nothing here deletes a branch. Merging is left to a human.
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        clog_debug!("GitOps::new path={}", repo_path.display());
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self { repo_path: root })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn repo_name(&self) -> String {
        self.repo_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string()
    }

    /// Create `branch` from HEAD and check it out at `worktree_path`.
    ///
    /// Returns the commit the branch starts from.
    pub fn create_run_branch(&self, branch: &str, worktree_path: &Path) -> Result<String> {
        clog_debug!(
            "GitOps::create_run_branch branch={} path={}",
            branch,
            worktree_path.display()
        );
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        let base = commit.id().to_string();
        let branch_ref = repo.branch(branch, &commit, false)?.into_reference();

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes; the folder name is a safe worktree name.
        let worktree_name = worktree_name(worktree_path, branch);
        repo.worktree(&worktree_name, worktree_path, Some(&opts))?;
        clog_debug!("Run branch {} created at {}", branch, base);
        Ok(base)
    }

    /// Check an existing run branch out again (e.g. after the worktree
    /// directory was removed). A worktree that is already there is reused.
    pub fn attach_run_branch(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        if worktree_path.join(".git").exists() {
            clog_debug!("Reusing worktree at {}", worktree_path.display());
            return Ok(());
        }
        let repo = self.repo()?;
        let reference = repo
            .find_branch(branch, git2::BranchType::Local)?
            .into_reference();
        let name = worktree_name(worktree_path, branch);
        // A stale admin dir from a deleted worktree blocks re-adding it.
        if let Ok(stale) = repo.find_worktree(&name) {
            let _ = stale.prune(Some(
                git2::WorktreePruneOptions::new().valid(true).working_tree(true),
            ));
        }
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(&name, worktree_path, Some(&opts))?;
        Ok(())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let found = match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        found
    }

    /// Branch `attempt_branch` from the tip of `from` and check it out at
    /// `worktree_path`. A leftover worktree or branch of the same name is
    /// replaced.
    pub fn create_attempt_worktree(
        &self,
        from: &str,
        attempt_branch: &str,
        worktree_path: &Path,
    ) -> Result<AttemptWorktree> {
        clog_debug!(
            "GitOps::create_attempt_worktree from={} branch={} path={}",
            from,
            attempt_branch,
            worktree_path.display()
        );
        if worktree_path.exists() || self.branch_exists(attempt_branch)? {
            self.remove_attempt_worktree(attempt_branch, worktree_path)?;
        }
        let repo = self.repo()?;
        let commit = repo
            .find_branch(from, git2::BranchType::Local)?
            .get()
            .peel_to_commit()?;
        let base = commit.id().to_string();
        let branch_ref = repo.branch(attempt_branch, &commit, true)?.into_reference();

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        let name = worktree_name(worktree_path, attempt_branch);
        repo.worktree(&name, worktree_path, Some(&opts))?;
        Ok(AttemptWorktree {
            path: worktree_path.to_path_buf(),
            branch: attempt_branch.to_string(),
            base,
        })
    }

    /// Drop an attempt worktree together with its branch.
    pub fn remove_attempt_worktree(&self, attempt_branch: &str, worktree_path: &Path) -> Result<()> {
        clog_debug!(
            "GitOps::remove_attempt_worktree branch={} path={}",
            attempt_branch,
            worktree_path.display()
        );
        let repo = self.repo()?;
        let name = worktree_name(worktree_path, attempt_branch);
        if let Ok(worktree) = repo.find_worktree(&name) {
            let _ = worktree.unlock();
            if let Err(e) = worktree.prune(Some(
                git2::WorktreePruneOptions::new()
                    .valid(true)
                    .working_tree(true)
                    .locked(true),
            )) {
                clog_warn!("Worktree prune failed for '{}': {}", name, e);
            }
        }
        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }
        match repo.find_branch(attempt_branch, git2::BranchType::Local) {
            Ok(mut branch) => {
                if let Err(e) = branch.delete() {
                    clog_warn!("Could not delete branch '{}': {}", attempt_branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Replay what an attempt changed since `base` onto the branch checked
    /// out at `worktree_path`, as one commit, and refresh that checkout.
    ///
    /// Returns `None` when the attempt changed nothing. When the attempt
    /// touches the same lines as work integrated since `base`, nothing is
    /// written and `MergeConflict` names the paths.
    pub fn integrate(
        worktree_path: &Path,
        base: &str,
        attempt_head: &str,
        message: &str,
    ) -> Result<Option<String>> {
        clog_debug!(
            "GitOps::integrate path={} base={} head={}",
            worktree_path.display(),
            base,
            attempt_head
        );
        let repo = Repository::open(worktree_path)?;
        let ancestor = repo.find_commit(Oid::from_str(base)?)?.tree()?;
        let theirs = repo.find_commit(Oid::from_str(attempt_head)?)?.tree()?;
        if theirs.id() == ancestor.id() {
            return Ok(None);
        }
        let head = repo.head()?.peel_to_commit()?;
        let ours = head.tree()?;

        let mut index = repo.merge_trees(&ancestor, &ours, &theirs, None)?;
        if index.has_conflicts() {
            let mut paths = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
                    paths.push(String::from_utf8_lossy(&entry.path).into_owned());
                }
            }
            return Err(Error::MergeConflict(paths));
        }
        let tree_id = index.write_tree_to(&repo)?;
        if tree_id == ours.id() {
            return Ok(None);
        }
        let tree = repo.find_tree(tree_id)?;
        let sig = signature(&repo)?;
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&head])?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;
        clog_debug!("Integrated {} as {}", attempt_head, commit_id);
        Ok(Some(commit_id.to_string()))
    }

    /// Tip of `branch`.
    pub fn branch_head(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo
            .find_branch(branch, git2::BranchType::Local)?
            .get()
            .peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Commit the given workspace-relative paths.
    ///
    /// Paths that no longer exist are removed from the index. Returns
    /// `None` when nothing changed relative to HEAD.
    pub fn commit_paths(
        worktree_path: &Path,
        paths: &[PathBuf],
        message: &str,
    ) -> Result<Option<String>> {
        clog_debug!(
            "GitOps::commit_paths path={} files={} message={}",
            worktree_path.display(),
            paths.len(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        for path in paths {
            let relative = path.strip_prefix(worktree_path).unwrap_or(path);
            if worktree_path.join(relative).exists() {
                index.add_path(relative)?;
            } else if let Err(e) = index.remove_path(relative) {
                clog_warn!("Could not drop {} from index: {}", relative.display(), e);
            }
        }
        index.write()?;
        commit_index(&repo, &mut index, message)
    }

    /// Commit every change in the worktree.
    pub fn commit_all(worktree_path: &Path, message: &str) -> Result<Option<String>> {
        clog_debug!(
            "GitOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;
        commit_index(&repo, &mut index, message)
    }

    /// HEAD commit of a worktree.
    pub fn head_commit(worktree_path: &Path) -> Result<String> {
        let repo = Repository::open(worktree_path)?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Uncommitted changes (staged or unstaged) in a worktree.
    pub fn is_dirty(worktree_path: &Path) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }
}

/// A private checkout for one attempt, branched from the run branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptWorktree {
    pub path: PathBuf,
    pub branch: String,
    /// Run branch tip the attempt started from.
    pub base: String,
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    Ok(repo
        .signature()
        .or_else(|_| Signature::now(COMMITTER_NAME, COMMITTER_EMAIL))?)
}

fn worktree_name(worktree_path: &Path, branch: &str) -> String {
    worktree_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(String::from)
        .unwrap_or_else(|| branch.replace('/', "-"))
}

fn commit_index(repo: &Repository, index: &mut git2::Index, message: &str) -> Result<Option<String>> {
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = signature(repo)?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(e) if e.code() == ErrorCode::UnbornBranch => None,
        Err(e) => return Err(e.into()),
    };
    if let Some(parent) = &parent {
        if parent.tree_id() == tree_id {
            clog_debug!("Nothing to commit");
            return Ok(None);
        }
    }

    let parents: Vec<&git2::Commit> = parent.iter().collect();
    let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    clog_debug!("Commit created: {}", commit_id);
    Ok(Some(commit_id.to_string()))
}
