//! Plan, deploy and clean a project
//!
//! All three commands load the project's declarations, open its store and
//! hand everything to the kind registry. Mutating runs show the plan and
//! ask for confirmation first unless `--yes` is given.

use anyhow::{Result, bail};
use reconcile::{DeploymentSummary, KindRegistry, Reconciler, RunOptions};
use std::path::Path;
use std::sync::Arc;

use crate::Context;
use crate::cli::{CleanArgs, DeployArgs, ProjectArgs};
use crate::config::{ConvergeConfig, Overrides};
use crate::kinds;
use crate::loader::{self, Declarations};
use crate::progress::DeployProgress;
use crate::store::FileStore;
use crate::ui;

/// Everything a command needs about one project directory
struct Project {
    config: ConvergeConfig,
    store: Arc<FileStore>,
    registry: KindRegistry,
    declarations: Declarations,
}

impl Project {
    fn open(dir: &Path) -> Result<Self> {
        let config = ConvergeConfig::load(dir)?;
        let store = Arc::new(FileStore::open(&config.store_path(dir))?);
        let registry = kinds::registry(&store)?;
        let declarations = loader::load(dir, &registry)?;
        log::info!(
            "{} declarations, store {}",
            declarations.total(),
            store.path().display()
        );
        Ok(Self {
            config,
            store,
            registry,
            declarations,
        })
    }

    fn deploy(&self, ctx: &Context, options: RunOptions) -> Result<DeploymentSummary> {
        let progress = DeployProgress::new(ctx.quiet || options.dry_run);
        let reconciler = Reconciler::new(options, self.store.as_ref(), &progress)?;
        let summary = self
            .registry
            .deploy_all(&reconciler, self.declarations.by_kind.clone());
        progress.finish();
        Ok(summary?)
    }

    fn clean(&self, ctx: &Context, options: RunOptions) -> Result<DeploymentSummary> {
        let progress = DeployProgress::new(ctx.quiet || options.dry_run);
        let reconciler = Reconciler::new(options, self.store.as_ref(), &progress)?;
        let summary = self
            .registry
            .clean_all(&reconciler, self.declarations.by_kind.clone());
        progress.finish();
        Ok(summary?)
    }
}

fn dry(mut options: RunOptions) -> RunOptions {
    options.dry_run = true;
    options
}

fn describe(dir: &Path, project: &Project) {
    ui::header(&format!("Project {}", dir.display()));
    ui::kv("store", &project.store.path().display().to_string());
    ui::kv("declarations", &project.declarations.total().to_string());
    if project.declarations.unrouted > 0 {
        ui::warn(&format!(
            "{} declarations did not match any resource kind",
            project.declarations.unrouted
        ));
    }
}

fn finish(ctx: &Context, summary: &DeploymentSummary) -> Result<()> {
    ui::summary(summary, ctx.verbose > 0);
    if !summary.is_success() {
        bail!("deployment finished with failures");
    }
    Ok(())
}

/// Confirm with user
fn confirm_proceed(prompt: &str) -> Result<bool> {
    use dialoguer::Confirm;

    let confirmed = Confirm::new().with_prompt(prompt).default(true).interact()?;

    Ok(confirmed)
}

pub fn plan(ctx: &Context, args: ProjectArgs) -> Result<()> {
    let project = Project::open(&args.dir)?;
    describe(&args.dir, &project);

    let overrides = Overrides {
        dry_run: true,
        verbose_diff: args.verbose_diff,
        prune: args.prune,
        ..Default::default()
    };
    let options = project.config.run_options(&overrides);
    let summary = project.deploy(ctx, options)?;
    finish(ctx, &summary)
}

pub fn deploy(ctx: &Context, args: DeployArgs) -> Result<()> {
    let project = Project::open(&args.dir)?;
    describe(&args.dir, &project);

    let overrides = Overrides {
        dry_run: args.dry_run,
        force_update: args.force_update,
        verbose_diff: args.verbose_diff,
        prune: args.prune,
        fail_fast: args.fail_fast,
        jobs: args.jobs,
        deadline_secs: args.deadline,
    };
    let options = project.config.run_options(&overrides);

    if !options.dry_run && !args.yes {
        let preview = project.deploy(ctx, dry(options.clone()))?;
        ui::summary(&preview, ctx.verbose > 0);
        if preview.totals().planned == 0 {
            ui::success("Nothing to deploy");
            return Ok(());
        }
        println!();
        if !confirm_proceed("Deploy these changes?")? {
            ui::info("Cancelled");
            return Ok(());
        }
    }

    let summary = project.deploy(ctx, options)?;
    finish(ctx, &summary)?;
    ui::success("Deployment complete");
    Ok(())
}

pub fn clean(ctx: &Context, args: CleanArgs) -> Result<()> {
    let project = Project::open(&args.dir)?;
    describe(&args.dir, &project);

    let overrides = Overrides {
        dry_run: args.dry_run,
        ..Default::default()
    };
    let options = project.config.run_options(&overrides);

    if !options.dry_run && !args.yes {
        let preview = project.clean(ctx, dry(options.clone()))?;
        ui::summary(&preview, ctx.verbose > 0);
        if preview.totals().planned == 0 {
            ui::success("Nothing to clean");
            return Ok(());
        }
        println!();
        if !confirm_proceed("Delete these resources?")? {
            ui::info("Cancelled");
            return Ok(());
        }
    }

    let summary = project.clean(ctx, options)?;
    finish(ctx, &summary)?;
    ui::success("Clean complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn ctx() -> Context {
        Context {
            verbose: 0,
            quiet: true,
        }
    }

    fn project(temp: &TempDir) -> PathBuf {
        let dir = temp.path().join("project");
        let models = dir.join("data_models");
        fs::create_dir_all(&models).unwrap();
        fs::write(
            models.join("model.json"),
            r#"[
                {"space": "sp"},
                {
                    "space": "sp", "externalId": "pump",
                    "properties": {"pressure": {"type": "float64"}}
                },
                {
                    "space": "sp", "externalId": "Pump", "version": "v1",
                    "properties": {
                        "pressure": {
                            "container": {"space": "sp", "externalId": "pump"},
                            "containerPropertyIdentifier": "pressure"
                        }
                    }
                }
            ]"#,
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_deploy_then_plan_is_unchanged() {
        let temp = TempDir::new().unwrap();
        let dir = project(&temp);

        let first = Project::open(&dir).unwrap();
        let summary = first.deploy(&ctx(), RunOptions::default()).unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.totals().created, 3);
        assert!(first.store.contains("views", "sp:Pump:v1"));

        let second = Project::open(&dir).unwrap();
        let plan = second.deploy(&ctx(), dry(RunOptions::default())).unwrap();
        assert_eq!(plan.totals().unchanged, 3);
        assert_eq!(plan.totals().planned, 0);
    }

    #[test]
    fn test_clean_removes_declared_resources() {
        let temp = TempDir::new().unwrap();
        let dir = project(&temp);
        let opened = Project::open(&dir).unwrap();
        opened.deploy(&ctx(), RunOptions::default()).unwrap();

        let summary = opened.clean(&ctx(), RunOptions::default()).unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.totals().deleted, 3);
        assert!(!opened.store.contains("spaces", "sp"));
    }

    #[test]
    fn test_denied_kind_skips_its_dependents() {
        let temp = TempDir::new().unwrap();
        let dir = project(&temp);
        fs::write(
            dir.join("store.json"),
            r#"{"principal": [{"acl": "dataModelsAcl", "actions": ["READ"], "scope": "all"}]}"#,
        )
        .unwrap();

        let opened = Project::open(&dir).unwrap();
        let summary = opened.deploy(&ctx(), RunOptions::default()).unwrap();

        assert!(!summary.is_success());
        assert!(matches!(
            summary.get("spaces").unwrap().status,
            reconcile::KindStatus::Failed(reconcile::Error::AccessDenied { .. })
        ));
        assert!(matches!(
            summary.get("views").unwrap().status,
            reconcile::KindStatus::Skipped(_)
        ));
        assert!(!opened.store.contains("spaces", "sp"));
    }

    #[test]
    fn test_plan_never_writes() {
        let temp = TempDir::new().unwrap();
        let dir = project(&temp);
        let opened = Project::open(&dir).unwrap();

        let plan = opened.deploy(&ctx(), dry(RunOptions::default())).unwrap();
        assert_eq!(plan.totals().planned, 3);
        assert!(!dir.join("store.json").exists());
    }
}
