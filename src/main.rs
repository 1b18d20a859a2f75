use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use trial_investigation_tracker::artifact;
use trial_investigation_tracker::client::InvestigationClient;
use trial_investigation_tracker::config::TrackerConfig;
use trial_investigation_tracker::error::TrackerError;
use trial_investigation_tracker::feed;
use trial_investigation_tracker::forecast;
use trial_investigation_tracker::models::{
    InterventionType, InvestigationHandle, InvestigationStatus, SupportLevel, TrialParameters,
    WhatIfScenario,
};
use trial_investigation_tracker::monitor::{self, MonitoringArtifact};
use trial_investigation_tracker::poller::StatusPoller;
use trial_investigation_tracker::report;
use trial_investigation_tracker::sites;
use trial_investigation_tracker::whatif::WhatIfEvaluator;

#[derive(Parser)]
#[command(name = "investigation-tracker")]
#[command(about = "Clinical trial site selection and enrollment monitoring", long_about = None)]
struct Cli {
    /// Investigation service base URL (overrides TRIAL_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// Status poll interval in milliseconds (overrides TRIAL_POLL_INTERVAL_MS)
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,
    /// Log debug output
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a site selection analysis
    Analyze {
        #[command(flatten)]
        trial: TrialArgs,
        /// Follow the investigation until it finishes
        #[arg(long)]
        watch: bool,
    },
    /// Start monitoring enrollment of a running trial
    Monitor {
        #[arg(long)]
        trial_id: String,
        #[arg(long)]
        watch: bool,
    },
    /// Follow an investigation until it finishes
    Watch {
        #[arg(long)]
        id: String,
    },
    /// Fetch the results of a completed investigation
    Results {
        #[arg(long)]
        id: String,
        #[arg(long, value_enum)]
        kind: ResultKind,
        /// Print the structured result instead of a markdown report
        #[arg(long)]
        json: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Ask the service to evaluate a what-if scenario
    WhatIf {
        #[arg(long)]
        site: Option<String>,
        #[command(flatten)]
        intervention: InterventionArgs,
    },
    /// Rank candidate sites from a local profile CSV
    Rank {
        #[arg(long)]
        profiles: PathBuf,
        #[command(flatten)]
        trial: TrialArgs,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Forecast trial enrollment from a local weekly feed
    Forecast {
        #[command(flatten)]
        inputs: FeedArgs,
    },
    /// Generate a markdown monitoring report from a local weekly feed
    Report {
        #[command(flatten)]
        inputs: FeedArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        /// Also export per-site statuses as CSV
        #[arg(long)]
        statuses_csv: Option<PathBuf>,
    },
    /// Evaluate a what-if scenario locally against a weekly feed
    Simulate {
        #[command(flatten)]
        inputs: FeedArgs,
        #[arg(long)]
        site: Option<String>,
        #[command(flatten)]
        intervention: InterventionArgs,
    },
    /// Check that the investigation service is up
    Health,
    /// Regenerate the service's synthetic data
    Regenerate,
    /// Clear all investigations held by the service
    Reset,
}

#[derive(Clone, Copy, ValueEnum)]
enum ResultKind {
    SiteAnalysis,
    Monitoring,
}

#[derive(Clone, Copy, ValueEnum)]
enum SupportArg {
    Low,
    Medium,
    High,
}

impl From<SupportArg> for SupportLevel {
    fn from(level: SupportArg) -> Self {
        match level {
            SupportArg::Low => SupportLevel::Low,
            SupportArg::Medium => SupportLevel::Medium,
            SupportArg::High => SupportLevel::High,
        }
    }
}

#[derive(Args)]
struct TrialArgs {
    #[arg(long, default_value = "3")]
    phase: String,
    #[arg(long, default_value = "oncology")]
    indication: String,
    #[arg(long, default_value_t = 200)]
    target_enrollment: u32,
    #[arg(long, default_value_t = 18)]
    duration_months: u32,
    #[arg(long, default_value_t = 10)]
    target_sites: u32,
}

impl TrialArgs {
    fn parameters(&self) -> TrialParameters {
        TrialParameters {
            phase: self.phase.clone(),
            indication: self.indication.clone(),
            target_enrollment: self.target_enrollment,
            duration_months: self.duration_months,
            target_sites: self.target_sites,
        }
    }
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct InterventionArgs {
    /// Recruitment budget in dollars; applies trial-wide unless --site is given
    #[arg(long)]
    budget: Option<u64>,
    /// Replace --site with this site
    #[arg(long)]
    replace_with: Option<String>,
    #[arg(long)]
    extend_weeks: Option<u32>,
    /// Raise support at --site to this level
    #[arg(long, value_enum)]
    support: Option<SupportArg>,
}

impl InterventionArgs {
    fn scenario(&self, site: Option<String>) -> WhatIfScenario {
        let mut scenario = WhatIfScenario {
            scenario_id: Uuid::new_v4().to_string(),
            intervention_type: InterventionType::AddRecruitmentBudget,
            target_site_id: site,
            budget_amount: None,
            replacement_site_id: None,
            extension_weeks: None,
            support_level: None,
        };
        if let Some(budget) = self.budget {
            scenario.budget_amount = Some(budget);
        } else if let Some(replacement) = &self.replace_with {
            scenario.intervention_type = InterventionType::ReplaceSite;
            scenario.replacement_site_id = Some(replacement.clone());
        } else if let Some(weeks) = self.extend_weeks {
            scenario.intervention_type = InterventionType::ExtendTrialDuration;
            scenario.extension_weeks = Some(weeks);
        } else if let Some(level) = self.support {
            scenario.intervention_type = InterventionType::IncreaseSiteSupport;
            scenario.support_level = Some(level.into());
        }
        scenario
    }
}

#[derive(Args)]
struct FeedArgs {
    /// Weekly enrollment feed CSV
    #[arg(long)]
    feed: PathBuf,
    /// Site directory CSV (active and candidate sites)
    #[arg(long)]
    sites: Option<PathBuf>,
    #[arg(long)]
    trial_id: String,
    #[arg(long)]
    target: u32,
    #[arg(long, default_value_t = 52)]
    total_weeks: u32,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl FeedArgs {
    fn load(&self) -> anyhow::Result<MonitoringArtifact> {
        let weekly_enrollment = feed::load_weekly_feed(&self.feed)
            .with_context(|| format!("failed to read weekly feed {}", self.feed.display()))?;
        let directory = match &self.sites {
            Some(path) => feed::load_site_directory(path)
                .with_context(|| format!("failed to read site directory {}", path.display()))?,
            None => feed::SiteDirectory::default(),
        };

        Ok(MonitoringArtifact {
            trial_id: self.trial_id.clone(),
            target_enrollment: self.target,
            total_weeks: self.total_weeks,
            seed: self.seed,
            sites: directory.active,
            candidate_sites: directory.candidates,
            weekly_enrollment,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let mut config = TrackerConfig::from_env().context("invalid tracker configuration")?;
    if let Some(url) = cli.api_url {
        config.api_url = url.trim_end_matches('/').to_string();
    }
    if let Some(ms) = cli.poll_interval_ms {
        anyhow::ensure!(ms > 0, "--poll-interval-ms must be positive");
        config.poll.interval = Duration::from_millis(ms);
    }

    match cli.command {
        Commands::Analyze { trial, watch } => {
            let client = connect(&config)?;
            let handle = client.start_site_analysis(trial.parameters()).await?;
            print_handle(&handle);
            if watch {
                watch_investigation(client, &config, handle.investigation_id()).await?;
            }
        }
        Commands::Monitor { trial_id, watch } => {
            let client = connect(&config)?;
            let handle = client.start_trial_monitoring(trial_id).await?;
            print_handle(&handle);
            if watch {
                watch_investigation(client, &config, handle.investigation_id()).await?;
            }
        }
        Commands::Watch { id } => {
            let client = connect(&config)?;
            watch_investigation(client, &config, &id).await?;
        }
        Commands::Results {
            id,
            kind,
            json,
            out,
        } => {
            let client = connect(&config)?;
            let status = client.status(&id).await?;
            artifact::require_complete(&status)?;

            let rendered = match kind {
                ResultKind::SiteAnalysis => {
                    let result = client.site_analysis_results(&id).await?;
                    if json {
                        serde_json::to_string_pretty(&result)?
                    } else {
                        report::build_site_analysis_report(&result, 10)
                    }
                }
                ResultKind::Monitoring => {
                    let result = client.monitoring_results(&id).await?;
                    if json {
                        serde_json::to_string_pretty(&result)?
                    } else {
                        report::build_monitoring_report(&result)
                    }
                }
            };
            emit(&rendered, out.as_ref())?;
        }
        Commands::WhatIf { site, intervention } => {
            let client = connect(&config)?;
            let result = client.what_if(&intervention.scenario(site)).await?;
            print!("{}", report::build_what_if_report(&[result]));
        }
        Commands::Rank {
            profiles,
            trial,
            limit,
        } => {
            let profiles = feed::load_site_profiles(&profiles)
                .with_context(|| format!("failed to read site profiles {}", profiles.display()))?;
            let result = sites::rank_sites(
                &profiles,
                &trial.parameters(),
                &Uuid::new_v4().to_string(),
                Utc::now(),
            );
            print!("{}", report::build_site_analysis_report(&result, limit));
        }
        Commands::Forecast { inputs } => {
            let artifact = inputs.load()?;
            artifact
                .validate()
                .map_err(TrackerError::InvalidInput)?;
            let forecast = forecast::forecast(&artifact.forecast_input(Utc::now()), &config.forecast)?;

            println!(
                "{}: {} of {} enrolled after {} of {} weeks (run rate {:.2}/week)",
                forecast.trial_id,
                forecast.current_total_enrolled,
                forecast.target_total_enrollment,
                forecast.weeks_elapsed,
                forecast.total_weeks,
                forecast.run_rate
            );
            println!(
                "Projected final {} (worst {}, best {}), P(target) {:.1}%",
                forecast.expected_final_enrollment,
                forecast.worst_case_enrollment,
                forecast.best_case_enrollment,
                forecast.probability_of_meeting_target * 100.0
            );
            match forecast.projected_completion_date {
                Some(date) => println!("Projected completion {date}."),
                None => println!("Target not reached at the current rate."),
            }
        }
        Commands::Report {
            inputs,
            out,
            statuses_csv,
        } => {
            let artifact = inputs.load()?;
            let result = monitor::analyze(
                &artifact,
                &Uuid::new_v4().to_string(),
                Utc::now(),
                &config.forecast,
            )?;
            std::fs::write(&out, report::build_monitoring_report(&result))
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());

            if let Some(path) = statuses_csv {
                let file = std::fs::File::create(&path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                feed::write_site_statuses(file, &result.site_statuses)?;
                println!("Site statuses written to {}.", path.display());
            }
        }
        Commands::Simulate {
            inputs,
            site,
            intervention,
        } => {
            let artifact = inputs.load()?;
            artifact
                .validate()
                .map_err(TrackerError::InvalidInput)?;
            let evaluator = WhatIfEvaluator::new(config.forecast.clone(), config.what_if.clone());
            let result = evaluator.evaluate(&intervention.scenario(site), &artifact.baseline(Utc::now()))?;
            print!("{}", report::build_what_if_report(&[result]));
        }
        Commands::Health => {
            let client = connect(&config)?;
            let health = client.health().await?;
            println!(
                "{} is {}.",
                health.service.as_deref().unwrap_or(client.base_url()),
                health.status
            );
        }
        Commands::Regenerate => {
            let ack = connect(&config)?.regenerate_data().await?;
            println!("{}", ack.message);
        }
        Commands::Reset => {
            let ack = connect(&config)?.reset().await?;
            println!("{}", ack.message);
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "warn" };

    let filter = tracing_subscriber::EnvFilter::try_from_env("TRIAL_TRACKER_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

fn connect(config: &TrackerConfig) -> anyhow::Result<InvestigationClient> {
    InvestigationClient::new(config.api_url.clone(), config.poll.fetch_timeout)
        .with_context(|| format!("failed to build a client for {}", config.api_url))
}

fn print_handle(handle: &InvestigationHandle) {
    match handle.trial_id() {
        Some(trial_id) => println!(
            "Started investigation {} for {trial_id} ({}).",
            handle.investigation_id(),
            handle.submitted_status()
        ),
        None => println!(
            "Started investigation {} ({}).",
            handle.investigation_id(),
            handle.submitted_status()
        ),
    }
}

async fn watch_investigation(
    client: InvestigationClient,
    config: &TrackerConfig,
    investigation_id: &str,
) -> anyhow::Result<()> {
    let poller = StatusPoller::new(Arc::new(client), config.poll.clone());
    let mut last_line = String::new();

    let status = poller
        .poll(investigation_id, |status: &InvestigationStatus| {
            let line = progress_line(status);
            if line != last_line {
                println!("{line}");
                last_line = line;
            }
        })
        .await?;

    println!(
        "Investigation {} finished: {}.",
        status.investigation_id, status.status
    );
    Ok(())
}

fn progress_line(status: &InvestigationStatus) -> String {
    let percent = status.progress() * 100.0;
    match status.running_agent() {
        Some(agent) => format!("[{percent:>3.0}%] {} ({})", agent.agent_name, status.status),
        None => format!("[{percent:>3.0}%] {}", status.status),
    }
}

fn emit(rendered: &str, out: Option<&PathBuf>) -> anyhow::Result<()> {
    match out {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Written to {}.", path.display());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}
