use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use refiner_contracts::events::EventWriter;
use refiner_contracts::models::{Capability, ModelCatalog, ModelSpec};
use refiner_contracts::runs::trace::{final_block, round_block};
use refiner_contracts::Idea;
use refiner_engine::{
    build_judge, default_provider_registry, Judge, JudgeOptions, RefineConfig, RetryPolicy,
    RunArchive, RunDriver, RunOutcome, VerboseJudge,
};

#[derive(Debug, Parser)]
#[command(name = "refiner-rs", version, about = "Iterative idea-to-image refinement")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Refine one idea, or every line of a test file.
    Run(RunArgs),
    /// List known judge and image models.
    Models(ModelsArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// One idea per line; `<IMG>path<IMG>` embeds a reference image.
    #[arg(long, required_unless_present = "idea", conflicts_with = "idea")]
    testfile: Option<PathBuf>,
    #[arg(long)]
    idea: Option<String>,
    #[arg(long, default_value_t = 3)]
    num_prompt: usize,
    #[arg(long, default_value_t = 3)]
    max_rounds: usize,
    #[arg(long, default_value_t = 1)]
    num_img: usize,
    #[arg(long, default_value_t = 1.0)]
    strength: f64,
    #[arg(long, default_value = "1024x1024")]
    size: String,
    #[arg(long, default_value = "self_refinement/candidates")]
    out: PathBuf,
    #[arg(long, default_value = "image")]
    final_name: String,
    /// Rounds excluded from the final cross-round selection.
    #[arg(long, default_value_t = 0)]
    start_offset: usize,
    #[arg(long, default_value = "gpt-4o")]
    judge_model: String,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    parallel_render: bool,
    #[arg(long, default_value_t = 8)]
    judge_max_attempts: u32,
    /// Seconds between judge attempts.
    #[arg(long, default_value_t = 10.0)]
    judge_backoff: f64,
    /// Overall budget in seconds for one judge call, retries included.
    #[arg(long)]
    judge_deadline: Option<f64>,
    #[arg(long)]
    verbose: bool,
    #[arg(long)]
    api_key: Option<String>,
}

#[derive(Debug, Parser)]
struct ModelsArgs {
    /// Only models with this capability (`judge` or `image`).
    #[arg(long, value_parser = parse_capability)]
    capability: Option<Capability>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("refiner-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_refine(args),
        Command::Models(args) => run_models(args),
    }
}

fn run_refine(args: RunArgs) -> Result<i32> {
    let ideas = load_ideas(&args)?;
    let catalog = ModelCatalog::builtin();
    let judge_model = select_model(&catalog, Some(&args.judge_model), Capability::Judge)?;
    let image_model = select_model(&catalog, args.image_model.as_deref(), Capability::Image)?;
    let providers = default_provider_registry();
    let provider = providers.for_model(&image_model)?;

    let config = refine_config(&args, &image_model.name);
    let policy = retry_policy(&args)?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let batch_events = EventWriter::new(&events_path, "batch");

    let mut failures = 0usize;
    for (idx, idea) in ideas.iter().enumerate() {
        let events = batch_events.scoped(uuid::Uuid::new_v4().to_string());
        let result = build_sample_judge(&judge_model, &args, &policy, &events).and_then(|judge| {
            let archive = RunArchive::new(&args.out, idea, &args.final_name);
            RunDriver::new(judge.as_ref(), provider, config.clone(), events.clone())
                .run(idea, &archive)
        });
        match result {
            Ok(outcome) => print_outcome(idea, &outcome),
            Err(err) => {
                failures += 1;
                eprintln!("refiner-rs error: sample {idx} ({}): {err:#}", idea.label());
            }
        }
    }

    println!(
        "Finished {} idea(s), {failures} failed. Events: {}",
        ideas.len(),
        events_path.display()
    );
    Ok(if failures > 0 { 1 } else { 0 })
}

fn run_models(args: ModelsArgs) -> Result<i32> {
    for model in ModelCatalog::builtin().list(args.capability) {
        println!("{}\t{}\t{}", model.name, model.provider, model.capability);
    }
    Ok(0)
}

fn load_ideas(args: &RunArgs) -> Result<Vec<Idea>> {
    match (&args.testfile, &args.idea) {
        (Some(path), _) => read_idea_file(path),
        (None, Some(line)) => Ok(vec![Idea::parse(line)?]),
        (None, None) => bail!("either --testfile or --idea is required"),
    }
}

/// Blank lines are skipped.
fn read_idea_file(path: &Path) -> Result<Vec<Idea>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read idea file {}", path.display()))?;
    let ideas = raw
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            Idea::parse(line).with_context(|| format!("{}:{}", path.display(), idx + 1))
        })
        .collect::<Result<Vec<_>>>()?;
    if ideas.is_empty() {
        bail!("idea file {} has no ideas", path.display());
    }
    Ok(ideas)
}

fn parse_capability(value: &str) -> Result<Capability, String> {
    value.parse()
}

/// Resolves a model, noting any substitution on stderr.
fn select_model(
    catalog: &ModelCatalog,
    requested: Option<&str>,
    capability: Capability,
) -> Result<ModelSpec> {
    let resolved = catalog.resolve(requested, capability)?;
    if let Some(note) = &resolved.substituted {
        eprintln!("{note}");
    }
    Ok(resolved.model)
}

fn refine_config(args: &RunArgs, image_model: &str) -> RefineConfig {
    RefineConfig {
        num_prompts: args.num_prompt,
        max_rounds: args.max_rounds,
        images_per_prompt: args.num_img,
        strength: args.strength,
        size: args.size.clone(),
        start_offset: args.start_offset,
        image_model: image_model.to_string(),
        api_key: args.api_key.clone(),
        seed: args.seed,
        parallel_render: args.parallel_render,
        ..RefineConfig::default()
    }
}

fn retry_policy(args: &RunArgs) -> Result<RetryPolicy> {
    if !args.judge_backoff.is_finite() || args.judge_backoff < 0.0 {
        bail!("--judge-backoff must be a non-negative number of seconds");
    }
    let deadline = match args.judge_deadline {
        Some(seconds) if !seconds.is_finite() || seconds <= 0.0 => {
            bail!("--judge-deadline must be a positive number of seconds")
        }
        Some(seconds) => Some(Duration::from_secs_f64(seconds)),
        None => None,
    };
    Ok(RetryPolicy {
        max_attempts: args.judge_max_attempts.max(1),
        backoff: Duration::from_secs_f64(args.judge_backoff),
        deadline,
        ..RetryPolicy::default()
    })
}

fn build_sample_judge(
    model: &ModelSpec,
    args: &RunArgs,
    policy: &RetryPolicy,
    events: &EventWriter,
) -> Result<Box<dyn Judge>> {
    let judge = build_judge(
        model,
        JudgeOptions {
            api_key: args.api_key.clone(),
            policy: policy.clone(),
            events: Some(events.clone()),
            request_timeout: None,
        },
    )?;
    if args.verbose {
        return Ok(Box::new(VerboseJudge::new(judge)));
    }
    Ok(judge)
}

fn print_outcome(idea: &Idea, outcome: &RunOutcome) {
    for record in outcome.history.records() {
        print!("{}", round_block(idea.label(), record));
    }
    print!("{}", final_block(outcome.final_round, &outcome.global));
    println!("Final image: {}", outcome.final_image.display());
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use refiner_contracts::models::{Capability, ModelCatalog};

    use super::{load_ideas, refine_config, retry_policy, select_model, Cli, Command};

    fn run_args(argv: &[&str]) -> super::RunArgs {
        let mut full = vec!["refiner-rs", "run"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full) {
            Ok(Cli {
                command: Command::Run(args),
            }) => args,
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn run_defaults_match_documented_values() {
        let args = run_args(&["--idea", "a red bicycle"]);
        assert_eq!(args.num_prompt, 3);
        assert_eq!(args.max_rounds, 3);
        assert_eq!(args.num_img, 1);
        assert_eq!(args.judge_model, "gpt-4o");
        assert_eq!(args.out.to_string_lossy(), "self_refinement/candidates");
        assert_eq!(args.final_name, "image");
        let config = refine_config(&args, "dryrun-image-1");
        assert_eq!(config.start_offset, 0);
        assert_eq!(config.image_model, "dryrun-image-1");
    }

    #[test]
    fn models_capability_filter_parses() {
        match Cli::try_parse_from(["refiner-rs", "models", "--capability", "image"]) {
            Ok(Cli {
                command: Command::Models(args),
            }) => assert_eq!(args.capability, Some(Capability::Image)),
            other => panic!("unexpected parse result: {other:?}"),
        }
        assert!(Cli::try_parse_from(["refiner-rs", "models", "--capability", "audio"]).is_err());
    }

    #[test]
    fn judge_and_image_flags_resolve_against_the_catalog() -> anyhow::Result<()> {
        let catalog = ModelCatalog::builtin();
        let args = run_args(&[
            "--idea",
            "a kite",
            "--judge-model",
            "dryrun-judge-1",
            "--image-model",
            "gpt-4o",
        ]);
        let judge = select_model(&catalog, Some(&args.judge_model), Capability::Judge)?;
        assert_eq!(judge.name, "dryrun-judge-1");
        let image = select_model(&catalog, args.image_model.as_deref(), Capability::Image)?;
        assert_eq!(image.capability, Capability::Image);
        assert_eq!(image.name, "gpt-image-1");
        Ok(())
    }

    #[test]
    fn idea_source_is_required_and_exclusive() {
        assert!(Cli::try_parse_from(["refiner-rs", "run"]).is_err());
        assert!(Cli::try_parse_from([
            "refiner-rs",
            "run",
            "--idea",
            "a kite",
            "--testfile",
            "ideas.txt"
        ])
        .is_err());
    }

    #[test]
    fn testfile_skips_blank_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("ideas.txt");
        std::fs::write(&path, "a red bicycle\n\n   \na dog like <IMG>dog.png<IMG> on a sofa\n")?;
        let args = run_args(&["--testfile", &path.to_string_lossy()]);
        let ideas = load_ideas(&args)?;
        assert_eq!(ideas.len(), 2);
        assert_eq!(ideas[1].reference_images().count(), 1);
        Ok(())
    }

    #[test]
    fn retry_flags_shape_the_policy() -> anyhow::Result<()> {
        let args = run_args(&[
            "--idea",
            "a kite",
            "--judge-max-attempts",
            "3",
            "--judge-backoff",
            "0.5",
            "--judge-deadline",
            "30",
        ]);
        let policy = retry_policy(&args)?;
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff.as_millis(), 500);
        assert_eq!(policy.deadline.map(|d| d.as_secs()), Some(30));

        let bad = run_args(&["--idea", "a kite", "--judge-deadline", "0"]);
        assert!(retry_policy(&bad).is_err());
        Ok(())
    }
}
