use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use toolchain_bootstrap::build_op::CommandBuild;
use toolchain_bootstrap::config::{self, BuildDefinition, FetchConfig, PublishConfig};
use toolchain_bootstrap::context::{BuildContext, Overrides};
use toolchain_bootstrap::events::StdoutSink;
use toolchain_bootstrap::fetch::{Fetcher, GitCli, HttpTransport, RetryPolicy, ThreadSleeper};
use toolchain_bootstrap::pipeline::{self, Pipeline};
use toolchain_bootstrap::store::ContentStore;
use toolchain_bootstrap::unpack::PatchTool;
use toolchain_bootstrap::verify::{self, DigestPolicy};
use toolchain_bootstrap::workspace::{self, CleanMode, WorkspaceConfig};
use toolchain_bootstrap::{Error, Result, interrupt, publish};

#[derive(Debug, Parser)]
#[command(name = "tcb", author, version, about)]
struct Args {
    /// Emit diagnostics as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, clap::Args)]
struct BuildArgs {
    /// Path to a build definition TOML
    build: PathBuf,
    /// Target triple (overrides TCB_TARGET and [toolchain].target)
    #[arg(long)]
    target: Option<String>,
    /// Content Store directory (overrides TCB_CACHE_DIR and [workspace].cache_dir)
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Parallelism hint for build operations (0 = CPU count)
    #[arg(long)]
    jobs: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CleanArg {
    Build,
    Prefix,
    All,
}

impl From<CleanArg> for CleanMode {
    fn from(v: CleanArg) -> Self {
        match v {
            CleanArg::Build => CleanMode::Build,
            CleanArg::Prefix => CleanMode::Prefix,
            CleanArg::All => CleanMode::All,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List stages in order with their completion state
    Plan {
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Run every incomplete stage, then write provenance and publish
    Run {
        #[command(flatten)]
        build: BuildArgs,
        /// Report what would run without fetching or building
        #[arg(long)]
        dry_run: bool,
        /// Apply [workspace].clean before running
        #[arg(long)]
        clean: bool,
    },
    /// Fetch and verify every stage source into the Content Store
    Fetch {
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Check an artifact against a digest or its stored signature
    Verify {
        path: PathBuf,
        /// Expected sha256; defaults to the artifact's signature file
        #[arg(long)]
        sha256: Option<String>,
        /// raw, full_extract or xz_stream
        #[arg(long, default_value = "raw")]
        policy: String,
    },
    /// Archive the Staging Tree into the Content Store now
    Publish {
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Print the build definition after imports/extends
    Resolve {
        /// Path to a build definition TOML
        build: PathBuf,
    },
    /// Remove build state (the Content Store is never touched)
    Clean {
        #[command(flatten)]
        build: BuildArgs,
        /// Defaults to [workspace].clean
        #[arg(value_enum)]
        mode: Option<CleanArg>,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _ = dotenv::dotenv();
    init_tracing(args.log_json);
    if let Err(e) = interrupt::install() {
        eprintln!("warning: {e}");
    }

    match dispatch(args.cmd) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn dispatch(cmd: Command) -> Result<()> {
    match cmd {
        Command::Plan { build } => cmd_plan(&build),
        Command::Run {
            build,
            dry_run,
            clean,
        } => cmd_run(&build, dry_run, clean),
        Command::Fetch { build } => cmd_fetch(&build),
        Command::Verify {
            path,
            sha256,
            policy,
        } => cmd_verify(&path, sha256.as_deref(), &policy),
        Command::Publish { build } => cmd_publish(&build),
        Command::Resolve { build } => cmd_resolve(&build),
        Command::Clean { build, mode } => cmd_clean(&build, mode),
    }
}

fn load(args: &BuildArgs, dry_run: bool) -> Result<(BuildDefinition, BuildContext)> {
    let def = config::load(&args.build)?;
    let ov = Overrides {
        target: args.target.clone(),
        cache_dir: args.cache_dir.clone(),
        jobs: args.jobs,
        dry_run,
    };
    let ctx = BuildContext::from_definition(&def, &ov)?;
    Ok((def, ctx))
}

fn make_fetcher(def: &BuildDefinition, ctx: &BuildContext) -> Result<Fetcher> {
    let cfg: FetchConfig = def.section_or_default("fetch")?;
    let retry = RetryPolicy::from_config(&cfg)?;
    let transport = HttpTransport::new(Duration::from_secs(cfg.connect_timeout_secs))?;
    let git = ctx
        .tools
        .get("GIT")
        .map(|p| GitCli::with_program(p.as_str()))
        .unwrap_or_default();
    Ok(Fetcher::new(
        ContentStore::at(ctx.cache_dir()),
        retry,
        Box::new(transport),
        Box::new(ThreadSleeper),
        Box::new(git),
    ))
}

fn make_builder(ctx: &BuildContext) -> CommandBuild {
    ctx.tools
        .get("SHELL")
        .map(|p| CommandBuild::with_shell(p.as_str()))
        .unwrap_or_default()
}

fn make_patcher(ctx: &BuildContext) -> PatchTool {
    ctx.tools
        .get("PATCH")
        .map(|p| PatchTool::with_program(p.as_str()))
        .unwrap_or_default()
}

fn cmd_plan(args: &BuildArgs) -> Result<()> {
    let (def, ctx) = load(args, true)?;
    let stages = pipeline::plan(&def, &ctx)?;
    let fetcher = make_fetcher(&def, &ctx)?;
    let builder = CommandBuild::default();
    let sink = Arc::new(StdoutSink::new(ctx.build_dir().join("error-logs")));
    let p = Pipeline::new(&ctx, &fetcher, &builder, sink);

    println!("toolchain: {} (target {}, jobs {})", ctx.name, ctx.target, ctx.jobs);
    for (i, (s, (id, state))) in stages.iter().zip(p.status(&stages)).enumerate() {
        let origin = s
            .request
            .as_ref()
            .map(|r| r.mode.origin())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:>2}. {:<34} {:<22} {}",
            i + 1,
            id,
            state.to_string(),
            origin
        );
    }
    Ok(())
}

fn cmd_run(args: &BuildArgs, dry_run: bool, clean: bool) -> Result<()> {
    let (def, ctx) = load(args, dry_run)?;
    if clean && !dry_run {
        let ws: WorkspaceConfig = def.section_or_default("workspace")?;
        for dir in workspace::clean(&ctx.workspace, ws.clean)? {
            println!("CLEAN: {}", dir.display());
        }
    }
    let stages = pipeline::plan(&def, &ctx)?;
    let publish_cfg: PublishConfig = def.section_or_default("publish")?;
    let fetcher = make_fetcher(&def, &ctx)?;
    let builder = make_builder(&ctx);
    let sink = Arc::new(StdoutSink::new(ctx.build_dir().join("error-logs")));
    let report = Pipeline::new(&ctx, &fetcher, &builder, sink)
        .with_patcher(make_patcher(&ctx))
        .with_publish(Some(publish_cfg))
        .run(&stages)?;

    if let Some(v) = &report.version_file {
        println!("VERSION: {}", v.display());
    }
    if let Some(p) = &report.published {
        println!("PUBLISHED: {} ({})", p.archive.display(), p.digest);
        if let Some(ptr) = &p.pointer {
            println!("RELEASE: {}", ptr.display());
        }
    }
    Ok(())
}

fn cmd_fetch(args: &BuildArgs) -> Result<()> {
    let (def, ctx) = load(args, false)?;
    let stages = pipeline::plan(&def, &ctx)?;
    ContentStore::open(ctx.cache_dir())?;
    let fetcher = make_fetcher(&def, &ctx)?;
    let builder = CommandBuild::default();
    let sink = Arc::new(StdoutSink::new(ctx.build_dir().join("error-logs")));
    let p = Pipeline::new(&ctx, &fetcher, &builder, sink);
    for path in p.fetch_all(&stages)? {
        println!("OK: {}", path.display());
    }
    Ok(())
}

fn cmd_verify(path: &Path, sha256: Option<&str>, policy: &str) -> Result<()> {
    let policy: DigestPolicy = policy.parse()?;
    if !path.is_file() {
        return Err(Error::NotFound(path.display().to_string()));
    }
    verify::verify(path, sha256, policy)?;
    println!("OK: {} ({})", path.display(), policy.as_str());
    Ok(())
}

fn cmd_publish(args: &BuildArgs) -> Result<()> {
    let (def, ctx) = load(args, false)?;
    let cfg: PublishConfig = def.section_or_default("publish")?;
    let store = ContentStore::open(ctx.cache_dir())?;
    let out = publish::publish(&ctx, &store, &cfg, publish::source_date_epoch())?;
    println!("PUBLISHED: {} ({})", out.archive.display(), out.digest);
    if let Some(ptr) = &out.pointer {
        println!("RELEASE: {}", ptr.display());
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let def = config::load(path)?;
    let s = toml::to_string_pretty(&def.value)
        .map_err(|e| Error::msg(format!("failed to render TOML: {e}")))?;
    print!("{s}");
    Ok(())
}

fn cmd_clean(args: &BuildArgs, mode: Option<CleanArg>) -> Result<()> {
    let (def, ctx) = load(args, false)?;
    let mode = match mode {
        Some(m) => m.into(),
        None => def.section_or_default::<WorkspaceConfig>("workspace")?.clean,
    };
    if mode == CleanMode::None {
        println!("nothing to clean (mode {})", mode.as_str());
        return Ok(());
    }
    let removed = workspace::clean(&ctx.workspace, mode)?;
    if removed.is_empty() {
        println!("nothing to clean");
    }
    for dir in removed {
        println!("CLEAN: {}", dir.display());
    }
    Ok(())
}
