//! Canonical staging-tree layout: one set of relative paths rooted twice,
//! once for the invoking machine and once for the compute side.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const ROOT_VAR: &str = "MUSHER_ROOT";
pub const COMMON_VAR: &str = "MUSHER_COMMON";
pub const OUTPUT_VAR: &str = "MUSHER_OUTPUT";
pub const JOBS_VAR: &str = "MUSHER_JOBS";

pub const COMMON_DIR: &str = "common";
pub const OUTPUT_DIR: &str = "outputs";
pub const JOBS_DIR: &str = "jobs";

/// Which root a path should be resolved under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathSide {
    Local,
    Compute,
}

/// Matched local/compute paths for one staging entry. Only ever produced by
/// [`Environment::reserve`], so the two sides stay structurally parallel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathReservation {
    pub local: PathBuf,
    pub compute: PathBuf,
}

impl PathReservation {
    pub fn side(&self, side: PathSide) -> &Path {
        match side {
            PathSide::Local => &self.local,
            PathSide::Compute => &self.compute,
        }
    }

    /// Compute-side path as the string exported into job scripts.
    pub fn compute_str(&self) -> String {
        self.compute.to_string_lossy().into_owned()
    }
}

/// The staging roots for one pipeline.
#[derive(Clone, Debug)]
pub struct Environment {
    local_root: PathBuf,
    compute_root: PathBuf,
}

impl Environment {
    pub fn new(local_root: impl Into<PathBuf>, compute_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            compute_root: compute_root.into(),
        }
    }

    pub fn root(&self, side: PathSide) -> &Path {
        match side {
            PathSide::Local => &self.local_root,
            PathSide::Compute => &self.compute_root,
        }
    }

    /// Canonical environment variables for one side, in export order.
    pub fn vars(&self, side: PathSide) -> Vec<(&'static str, PathBuf)> {
        let root = self.root(side);
        vec![
            (ROOT_VAR, root.to_path_buf()),
            (COMMON_VAR, root.join(COMMON_DIR)),
            (OUTPUT_VAR, root.join(OUTPUT_DIR)),
            (JOBS_VAR, root.join(JOBS_DIR)),
        ]
    }

    /// Reserve matching paths under both roots for the given relative
    /// components.
    pub fn reserve<I, S>(&self, components: I) -> PathReservation
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut local = self.local_root.clone();
        let mut compute = self.compute_root.clone();
        for component in components {
            local.push(component.as_ref());
            compute.push(component.as_ref());
        }
        PathReservation { local, compute }
    }

    pub fn common(&self) -> PathReservation {
        self.reserve([COMMON_DIR])
    }

    pub fn outputs(&self) -> PathReservation {
        self.reserve([OUTPUT_DIR])
    }

    pub fn jobs(&self) -> PathReservation {
        self.reserve([JOBS_DIR])
    }

    pub fn job_dir(&self, job_id: &str) -> PathReservation {
        self.reserve([JOBS_DIR, job_id])
    }

    pub fn job_inputs(&self, job_id: &str) -> PathReservation {
        self.reserve([JOBS_DIR, job_id, "inputs"])
    }

    pub fn job_workspace(&self, job_id: &str) -> PathReservation {
        self.reserve([JOBS_DIR, job_id, "workspace"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_stay_parallel() {
        let env = Environment::new("/local/stage", "/cluster/stage");
        let reservation = env.reserve(["jobs", "3", "inputs", "reads.bam"]);
        assert_eq!(
            reservation.local,
            PathBuf::from("/local/stage/jobs/3/inputs/reads.bam")
        );
        assert_eq!(
            reservation.compute,
            PathBuf::from("/cluster/stage/jobs/3/inputs/reads.bam")
        );
    }

    #[test]
    fn vars_cover_the_canonical_tree() {
        let env = Environment::new("/l", "/c");
        let vars = env.vars(PathSide::Compute);
        assert_eq!(
            vars,
            vec![
                (ROOT_VAR, PathBuf::from("/c")),
                (COMMON_VAR, PathBuf::from("/c/common")),
                (OUTPUT_VAR, PathBuf::from("/c/outputs")),
                (JOBS_VAR, PathBuf::from("/c/jobs")),
            ]
        );
    }
}
