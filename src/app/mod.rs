//! Command dispatch for the `landmark-retrieval` binary.

mod args;

pub use args::{Cli, Command, EvaluateArgs, InitConfigArgs, RunArgs};

use anyhow::{bail, Context, Result};

use crate::config::PipelineSettings;
use crate::embedding::ModuleRegistry;
use crate::evaluation::{format_metrics, MetricsSummary};
use crate::services::{RetrievalPipeline, RunReport};

/// Main application entry point
pub struct App {
    cli: Cli,
}

impl App {
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Runs the selected command.
    pub async fn run(self) -> Result<()> {
        match &self.cli.command {
            Command::Run(args) => {
                let mut settings = self.settings()?;
                args.apply(&mut settings);
                let report = RetrievalPipeline::new(settings)
                    .run()
                    .await
                    .context("retrieval run failed")?;
                print_report(&report);
            }
            Command::Evaluate(args) => {
                let mut settings = self.settings()?;
                args.apply(&mut settings);
                let summary = RetrievalPipeline::evaluate_saved(&settings)
                    .context("evaluation failed")?;
                print_metrics(&summary);
            }
            Command::Modules => {
                let settings = self.settings()?;
                list_modules(&settings);
            }
            Command::InitConfig(args) => self.init_config(args)?,
        }
        Ok(())
    }

    fn settings(&self) -> Result<PipelineSettings> {
        PipelineSettings::load_or_default(self.cli.config.as_deref())
            .context("failed to load settings")
    }

    fn init_config(&self, args: &InitConfigArgs) -> Result<()> {
        let path = match args.path.clone().or_else(|| self.cli.config.clone()) {
            Some(path) => path,
            None => PipelineSettings::default_path()?,
        };
        if path.exists() && !args.force {
            bail!(
                "{} already exists, pass --force to replace it",
                path.display()
            );
        }

        let settings = PipelineSettings::for_dataset(args.dataset, &args.data_dir);
        settings
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), dataset = %args.dataset, "Wrote settings");
        println!("{}", path.display());
        Ok(())
    }
}

fn print_report(report: &RunReport) {
    println!(
        "run {}: {} of {} corpus images indexed, {} of {} queries ranked, {} failures",
        report.run_id,
        report.indexed_images,
        report.corpus_images,
        report.ranked_queries,
        report.queries,
        report.failures,
    );
    println!("outputs: {}", report.output_dir.display());
    if let Some(metrics) = &report.metrics {
        print_metrics(metrics);
    }
}

fn print_metrics(summary: &MetricsSummary) {
    print!("{}", format_metrics(summary));
}

fn list_modules(settings: &PipelineSettings) {
    let mut registry = ModuleRegistry::new();
    let specs = settings.embedder_specs();
    for spec in &specs {
        registry.set_status(spec.kind, spec.weights.status());
    }

    for module in registry.all_modules() {
        let source = specs
            .iter()
            .find(|spec| spec.kind == module.kind)
            .map(|spec| spec.weights.describe())
            .unwrap_or_else(|| "not configured".to_string());
        println!(
            "{:<20} {:<24} {:?}\t{}",
            module.kind.id(),
            module.name,
            module.status,
            source
        );
        println!(
            "{:<20} {} (weights file: {})",
            "", module.description, module.weights_file
        );
    }
}
