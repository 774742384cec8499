//! Pure rendering of job execution plans into the bash scripts each job
//! sources and runs. Planning stays testable as data; only this module knows
//! the target format.

use crate::storage;

use super::paths::{Environment, PathSide};
use super::plan::{
    Action, DiskSpec, ExportValue, JobExecutionPlan, CONTAINER_ARGS_VAR, JOB_VARS_VAR,
    LOCAL_DISK_DIR_VAR, LOCAL_DISK_SIZE_VAR, LOCAL_DISK_TYPE_VAR, NODE_NAME_VAR, NODE_ZONE_VAR,
};

/// Filename of the collector script staged at the root of the staging tree.
pub const COLLECTOR_FILENAME: &str = "delocalize.sh";

const SAFE_CHARS: &str = "@%+=:,./-_";

/// Minimal single-quote shell quoting.
pub fn sh_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || SAFE_CHARS.contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// The rendered three-phase scripts for one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobScripts {
    pub setup: String,
    pub localization: String,
    pub teardown: String,
}

pub fn render_job_scripts(plan: &JobExecutionPlan, env: &Environment) -> JobScripts {
    let mut setup = vec![
        "#!/bin/bash".to_string(),
        format!(
            "export {}={}",
            JOB_VARS_VAR,
            plan.job_vars
                .iter()
                .map(|name| sh_quote(name))
                .collect::<Vec<_>>()
                .join(":")
        ),
    ];
    for action in &plan.setup {
        render_action(action, plan, env, &mut setup);
    }
    setup.push(format!(
        "export {}=\"{}\"",
        CONTAINER_ARGS_VAR,
        plan.container_args.join(" ")
    ));
    setup.push(format!("cd ${}", super::plan::JOB_ROOT_VAR));

    let mut localization = vec!["#!/bin/bash".to_string(), "set -e".to_string()];
    for action in &plan.localization {
        render_action(action, plan, env, &mut localization);
    }
    localization.push("set +e".to_string());

    let mut teardown = vec!["#!/bin/bash".to_string()];
    for action in &plan.teardown {
        render_action(action, plan, env, &mut teardown);
    }

    JobScripts {
        setup: join_script(setup),
        localization: join_script(localization),
        teardown: join_script(teardown),
    }
}

fn join_script(lines: Vec<String>) -> String {
    let mut script = lines.join("\n");
    script.push('\n');
    script
}

fn render_action(action: &Action, plan: &JobExecutionPlan, env: &Environment, out: &mut Vec<String>) {
    match action {
        Action::Export { name, value } => match value {
            ExportValue::Literal(text) => out.push(format!("export {}={}", name, sh_quote(text))),
            ExportValue::Raw(text) => out.push(format!("export {name}={text}")),
        },
        Action::MakeDirs { path } => out.push(format!("mkdir -p {path}")),
        Action::ChangeDirIfExists { path } => {
            out.push(format!("if [[ -d {path} ]]; then cd {path}; fi"));
        }
        Action::ObjectCheck { url } => out.push(storage::object_check_command(url)),
        Action::MakeFifo { path } => {
            out.push(format!("if [[ -e {path} ]]; then rm {path}; fi"));
            out.push(format!("mkfifo {path}"));
        }
        Action::BackgroundRead {
            url,
            dest,
            user_project,
        } => out.push(storage::cat_command(url, dest, user_project.as_deref())),
        Action::GuardedDownload {
            url,
            dest,
            user_project,
        } => out.push(storage::guarded_download_command(
            url,
            dest,
            user_project.as_deref(),
        )),
        Action::DiskEnvironment { spec } => render_disk_environment(spec, out),
        Action::ProvisionDisk { spec } => render_provision_disk(spec, out),
        Action::TeardownDisk { spec } => render_teardown_disk(spec, out),
        Action::RemoveDirIfSet { var } => {
            out.push(format!(
                "if [[ -n \"${var}\" ]]; then rm -rf ${var}; fi"
            ));
        }
        Action::CollectOutputs { patterns } => {
            let root = env.root(PathSide::Compute).to_string_lossy().into_owned();
            let output_root = env.outputs().compute_str();
            let mut command = format!(
                "bash {root}/{COLLECTOR_FILENAME} {output_root} {}",
                plan.job_id
            );
            for (name, pattern) in patterns {
                command.push_str(&format!(" -p {} {}", sh_quote(name), sh_quote(pattern)));
            }
            out.push(command);
        }
    }
}

fn render_disk_environment(spec: &DiskSpec, out: &mut Vec<String>) {
    out.push(format!(
        "export {}={}GB",
        LOCAL_DISK_SIZE_VAR, spec.size_gib
    ));
    out.push(format!("export {}={}", LOCAL_DISK_TYPE_VAR, spec.disk_type));
    out.push(format!(
        "export {NODE_NAME_VAR}=$(curl -H \"Metadata-Flavor: Google\" http://metadata.google.internal/computeMetadata/v1/instance/name)"
    ));
    out.push(format!(
        "export {NODE_ZONE_VAR}=$(basename $(curl -H \"Metadata-Flavor: Google\" http://metadata.google.internal/computeMetadata/v1/instance/zone))"
    ));
    out.push(format!(
        "export {}={}",
        LOCAL_DISK_DIR_VAR, spec.mount_dir
    ));
}

fn render_provision_disk(spec: &DiskSpec, out: &mut Vec<String>) {
    out.push(format!("sudo mkdir -p ${LOCAL_DISK_DIR_VAR}"));
    out.push(format!(
        "if [[ -z \"${NODE_NAME_VAR}\" ]]; then echo \"Unable to provision disk (not running on a cloud instance); downloading to the boot disk\" > /dev/stderr; else"
    ));
    out.push(format!(
        "echo Provisioning and mounting temporary disk {}",
        spec.name
    ));
    out.push(format!(
        "gcloud compute disks create {} --size {} --type pd-{} --zone ${NODE_ZONE_VAR}",
        spec.name, spec.size_gib, spec.disk_type
    ));
    out.push(format!(
        "gcloud compute instances attach-disk ${NODE_NAME_VAR} --zone ${NODE_ZONE_VAR} --disk {} --device-name {}",
        spec.name, spec.device
    ));
    out.push(format!(
        "gcloud compute instances set-disk-auto-delete ${NODE_NAME_VAR} --zone ${NODE_ZONE_VAR} --disk {}",
        spec.name
    ));
    out.push(format!(
        "sudo mkfs.ext4 -m 0 -E lazy_itable_init=0,lazy_journal_init=0,discard /dev/disk/by-id/google-{}",
        spec.device
    ));
    out.push(format!(
        "sudo mount -o discard,defaults /dev/disk/by-id/google-{} ${LOCAL_DISK_DIR_VAR}",
        spec.device
    ));
    out.push(format!("sudo chmod -R a+rwX ${LOCAL_DISK_DIR_VAR}"));
    out.push("fi".to_string());
}

fn render_teardown_disk(spec: &DiskSpec, out: &mut Vec<String>) {
    out.push(format!("sudo umount {}", spec.mount_dir));
    out.push(format!(
        "gcloud compute instances detach-disk ${NODE_NAME_VAR} --zone ${NODE_ZONE_VAR} --disk {}",
        spec.name
    ));
    out.push(format!(
        "gcloud compute disks delete {} --zone ${NODE_ZONE_VAR} --quiet",
        spec.name
    ));
}

/// Node-side collector: resolves declared output patterns inside the job
/// workspace, links or copies matches into the shared output tree, and
/// writes the job's manifest fragment.
pub fn collector_script() -> &'static str {
    r#"#!/bin/bash
# usage: delocalize.sh <output_root> <job_id> [-c] [-p <name> <pattern>]...
output_root="$1"; shift
job_id="$1"; shift
copy=0
names=()
patterns=()
while [[ $# -gt 0 ]]; do
  case "$1" in
    -c) copy=1; shift ;;
    -p) names+=("$2"); patterns+=("$3"); shift 3 ;;
    *) shift ;;
  esac
done
job_dir="$output_root/$job_id"
mkdir -p "$job_dir"
manifest="$job_dir/.musher_job_manifest"
: > "$manifest"
for i in "${!names[@]}"; do
  name="${names[$i]}"
  for target in ${patterns[$i]}; do
    [[ -e "$target" ]] || continue
    if [[ "$name" == stdout || "$name" == stderr ]]; then
      dest="$job_dir/$name"
    else
      dest="$job_dir/$name/$target"
    fi
    if [[ ! -e "$dest" ]]; then
      mkdir -p "$(dirname "$dest")"
      if [[ -f "$target" ]]; then
        if [[ "$copy" == 1 ]]; then
          cp "$target" "$dest"
        else
          ln -s "$(readlink -f "$target")" "$dest" 2>/dev/null || cp "$target" "$dest"
        fi
      else
        cp -r "$target" "$dest"
      fi
    fi
    rel="${dest#"$output_root"/}"
    printf '%s\t%s\t%s\n' "$job_id" "$name" "$rel" >> "$manifest"
  done
done
"#
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::super::plan::JobPlanBuilder;
    use super::super::requests::LocalizationRequest;
    use super::*;

    #[test]
    fn quoting_passes_safe_values_and_wraps_others() {
        assert_eq!(sh_quote("plain-value_1.txt"), "plain-value_1.txt");
        assert_eq!(sh_quote("has space"), "'has space'");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
        assert_eq!(sh_quote(""), "''");
    }

    fn rendered(inputs: BTreeMap<String, LocalizationRequest>) -> JobScripts {
        let env = Environment::new("/l", "/c");
        let mut patterns = BTreeMap::new();
        patterns.insert("out".to_string(), "*.txt".to_string());
        patterns.insert("stdout".to_string(), "../stdout".to_string());
        let builder = JobPlanBuilder::new(&env, &patterns, Some("standard"), "/mnt/dl", "key");
        let plan = builder.build("7", &inputs, 0).unwrap();
        render_job_scripts(&plan, &env)
    }

    #[test]
    fn setup_exports_job_roots_and_changes_into_workspace() {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "sample".to_string(),
            LocalizationRequest::Literal {
                value: "s one".into(),
            },
        );
        let scripts = rendered(inputs);
        assert!(scripts.setup.starts_with("#!/bin/bash\n"));
        assert!(scripts.setup.contains("export MUSHER_JOB_VARS=sample"));
        assert!(scripts
            .setup
            .contains("export MUSHER_JOB_INPUTS=/c/jobs/7/inputs"));
        assert!(scripts.setup.contains("export sample='s one'"));
        assert!(scripts.setup.contains("export MUSHER_CONTAINER_ARGS=\"-v $MUSHER_ROOT:$MUSHER_ROOT\""));
        assert!(scripts.setup.trim_end().ends_with("cd $MUSHER_JOB_ROOT"));
    }

    #[test]
    fn localization_runs_under_errexit() {
        let scripts = rendered(BTreeMap::new());
        assert!(scripts.localization.starts_with("#!/bin/bash\nset -e\n"));
        assert!(scripts.localization.trim_end().ends_with("set +e"));
        assert!(scripts
            .localization
            .contains("if [[ -d $MUSHER_JOB_INPUTS ]]; then cd $MUSHER_JOB_INPUTS; fi"));
    }

    #[test]
    fn stream_inputs_render_check_fifo_and_background_read() {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "reads".to_string(),
            LocalizationRequest::Stream {
                url: "gs://b/reads.bam".into(),
                user_project: Some("proj".into()),
            },
        );
        let scripts = rendered(inputs);
        assert!(scripts.localization.contains("gsutil ls gs://b/reads.bam > /dev/null"));
        assert!(scripts.localization.contains("mkfifo $MUSHER_STREAM_DIR/reads.bam"));
        assert!(scripts
            .localization
            .contains("gsutil -u proj cat gs://b/reads.bam > $MUSHER_STREAM_DIR/reads.bam &"));
        assert!(scripts.setup.contains("export reads=$MUSHER_STREAM_DIR/reads.bam"));
    }

    #[test]
    fn teardown_invokes_collector_with_patterns() {
        let scripts = rendered(BTreeMap::new());
        assert!(scripts
            .teardown
            .contains("bash /c/delocalize.sh /c/outputs 7 -p out '*.txt' -p stdout ../stdout"));
    }

    #[test]
    fn rendering_is_stable_for_a_fixed_plan() {
        let first = rendered(BTreeMap::new());
        let second = rendered(BTreeMap::new());
        assert_eq!(first, second);
    }
}
