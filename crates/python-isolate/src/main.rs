use anyhow::Context;
use clap::Parser;
use python_isolate::{project, ProjectError};
use python_isolate::transport::{ExchangeFormat, JsonExchange};
use python_isolate::{ExecutionRequest, Executor, ExecutorConfig, PyFunction, Value};
use std::path::PathBuf;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

#[derive(clap::Parser, Debug)]
#[clap(about = "Run Python model functions in isolated environments.")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the entrypoint of a model file within one of the project's environments.
    Run(Run),
    /// List the environments declared by a project.
    Envs(Envs),
}

#[derive(clap::Args, Debug)]
struct Run {
    /// Directory holding the project's fal_project.yml.
    #[clap(long, default_value = ".")]
    project_dir: PathBuf,
    /// Name of the environment to run within.
    #[clap(long, default_value = project::LOCAL_ENVIRONMENT)]
    environment: String,
    /// Python source file of the model.
    #[clap(long)]
    model: PathBuf,
    /// Name of the function to call.
    #[clap(long, default_value = "main")]
    entrypoint: String,
    /// Table passed as a keyword argument, as NAME=PATH of a JSON table file.
    #[clap(long = "input", value_parser = parse_input)]
    inputs: Vec<(String, PathBuf)>,
    /// Relation readable through `read_df`, as NAME=PATH of a JSON table file.
    #[clap(long = "relation", value_parser = parse_input)]
    relations: Vec<(String, PathBuf)>,
    /// Call the entrypoint with `read_df` and `write_df`, even without relations.
    #[clap(long)]
    relation_io: bool,
    #[clap(flatten)]
    config: ExecutorConfig,
}

#[derive(clap::Args, Debug)]
struct Envs {
    /// Directory holding the project's fal_project.yml.
    #[clap(long, default_value = ".")]
    project_dir: PathBuf,
}

fn parse_input(arg: &str) -> Result<(String, PathBuf), String> {
    match arg.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected NAME=PATH, not {arg:?}")),
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into()) // Otherwise it's ERROR.
        .from_env_lossy();

    tracing_subscriber::fmt::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    let handle = runtime.spawn(async move {
        match cli.command {
            Command::Run(run) => do_run(run).await,
            Command::Envs(envs) => do_envs(envs),
        }
    });
    let result = runtime.block_on(handle);

    // We must call `shutdown_background()` because otherwise an incomplete spawned future
    // could block indefinitely.
    runtime.shutdown_background();

    if !result?? {
        std::process::exit(1);
    }
    Ok(())
}

async fn do_run(run: Run) -> anyhow::Result<bool> {
    let Run {
        project_dir,
        environment,
        model,
        entrypoint,
        inputs,
        relations,
        relation_io,
        config,
    } = run;

    let spec = project::fetch_environment(&project_dir, &environment)
        .with_context(|| format!("failed to resolve environment '{environment}'"))?;
    let source = std::fs::read_to_string(&model)
        .with_context(|| format!("failed to read model {}", model.display()))?;

    let function = PyFunction::new(source)
        .with_entrypoint(entrypoint)
        .with_filename(model.display().to_string());
    let mut request = ExecutionRequest::new(spec, function);

    for (name, path) in inputs {
        let table = JsonExchange
            .read_table(&path)
            .with_context(|| format!("failed to read input table {}", path.display()))?;
        request = request.kwarg(name, Value::Table(table));
    }
    if relation_io {
        request = request.with_relation_io();
    }
    for (name, path) in relations {
        let table = JsonExchange
            .read_table(&path)
            .with_context(|| format!("failed to read relation {}", path.display()))?;
        request = request.relation(&name, table);
    }

    let executor = Executor::new(config).context("failed to start executor")?;
    let outcome = executor.run(request).await;
    executor.shutdown();

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome.is_success())
}

fn do_envs(envs: Envs) -> anyhow::Result<bool> {
    let path = project::project_file(&envs.project_dir);

    let environments = match project::load_environments(&path) {
        Ok(environments) => environments,
        Err(ProjectError::Missing(_)) => Default::default(),
        Err(err) => return Err(err).context("failed to load environments"),
    };

    let local = python_isolate::EnvironmentSpec::local();
    println!("{}\t{}\t{}", project::LOCAL_ENVIRONMENT, local.kind(), local.content_hash());

    for (name, spec) in environments {
        println!("{name}\t{}\t{}", spec.kind(), spec.content_hash());
    }
    Ok(true)
}
