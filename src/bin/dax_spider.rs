use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dax_spider::auto::AutoSpider;
use dax_spider::cli::{auto_command, parse_auto};
use dax_spider::config::ManifestLoader;
use dax_spider::error::SpiderError;
use dax_spider::spider::Pipeline;

#[derive(Parser)]
#[command(name = "dax-spider")]
#[command(about = "Run an XNAT spider described by a JSON manifest")]
#[command(version, author)]
struct Cli {
    #[arg(short, long, help = "AutoSpider manifest (JSON)")]
    manifest: PathBuf,

    /// Flags of the spider itself, e.g. `-p PROJ -s SUBJ -e SESS -d /tmp/job --t1 ...`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    spider_args: Vec<OsString>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SpiderError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SpiderError) -> u8 {
    match error {
        error if error.is_configuration() => 2,
        SpiderError::NotOnXnat(_) | SpiderError::XnatHttp(_) | SpiderError::XnatStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let definition = ManifestLoader::load(&cli.manifest)?;

    let argv = std::iter::once(OsString::from(definition.name.clone())).chain(cli.spider_args);
    let matches = match auto_command(&definition)?.try_get_matches_from(argv) {
        Ok(matches) => matches,
        Err(err) => err.exit(),
    };
    let invocation = parse_auto(&definition, &matches)?;

    let mut spider = AutoSpider::new(definition, invocation)?;
    print!("{}", spider.spider());
    spider.go()?;
    Ok(())
}
