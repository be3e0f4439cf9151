mod output;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

use multisphinx::config::Config;
use multisphinx::dict::Dictionary;
use multisphinx::search_factory::Pipeline;
use multisphinx::testutil::{TinyAcmod, TinyDict, TinyDict2Pid, TinyLm};

use crate::output::{HypOutput, Segments, Words};

/// multisphinx: a concurrent multi-pass LVCSR search engine
///
/// This binary wires a [`Pipeline`] from a configuration file and runs
/// it to completion, printing the decoded hypothesis and, optionally,
/// the expanded lattice. multisphinx's acoustic model, dictionary, and
/// language model are external contracts (see `multisphinx::acmod`,
/// `multisphinx::dict`, `multisphinx::ngram`) that a real deployment
/// supplies; this binary ships `--demo`, a self-contained smoke test
/// against the crate's in-memory `testutil` fixtures, for exercising
/// the pipeline without any of those resources on hand.
#[derive(StructOpt)]
#[structopt(name = "multisphinx")]
struct Cli {
    /// Path to the setting file in JSON format
    #[structopt(short = "r", long = "config-file", parse(from_os_str))]
    config_file: Option<PathBuf>,

    /// Run the bundled in-memory demo (tiny dictionary/LM/acoustic
    /// model) instead of decoding real input. This is the only mode
    /// currently implemented; a real front end embeds this crate and
    /// supplies its own `Dictionary`/`LanguageModel`/`AcousticModel`.
    #[structopt(long = "demo")]
    demo: bool,

    /// Output format for the hypothesis: "words" (space-separated) or
    /// "segments" (one line per word with frame/score detail)
    #[structopt(long = "format", default_value = "words")]
    format: String,

    /// Write the expanded lattice as an HTK SLF file
    #[structopt(long = "lattice", parse(from_os_str))]
    lattice_file: Option<PathBuf>,

    /// Write the expanded lattice as a Graphviz DOT file
    #[structopt(long = "dot", parse(from_os_str))]
    dot_file: Option<PathBuf>,

    /// Output text file: if not present, use stdout
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output_file: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> multisphinx::error::MultisphinxResult<Config> {
    match &cli.config_file {
        Some(path) => Ok(Config::from_file(path)?),
        None => Ok(Config::default()),
    }
}

fn open_writer(path: &Option<PathBuf>) -> io::Result<output::Writer> {
    let inner: Box<dyn Write> = match path {
        Some(p) => Box::new(File::create(p)?),
        None => Box::new(io::stdout()),
    };
    Ok(BufWriter::new(inner))
}

/// Build a tiny in-memory dictionary/LM/acoustic model and run one
/// utterance through the full pipeline (spec.md §8's "single word
/// utterance" scenario, exercised end to end instead of unit-tested).
fn run_demo(cli: &Cli, config: Config) -> multisphinx::error::MultisphinxResult<()> {
    let dict = Arc::new(TinyDict::new());
    let d2p = Arc::new(TinyDict2Pid::new());
    let lm = Arc::new(TinyLm::unigram_only());
    let go = dict.wid_by_name("go").expect("demo dictionary always has \"go\"");
    let acmod = Arc::new(TinyAcmod::favoring(&dict, &[go], 10));

    let mut pipeline = Pipeline::new(config, dict.clone(), d2p, lm, acmod, 100.0);
    pipeline.run_utterance()?;

    let hyp = pipeline.hyp(None);
    let segments: Vec<_> = pipeline.fwdflat().seg_iter(None).collect();

    let mut writer = open_writer(&cli.output_file)?;
    let formatter: Box<dyn HypOutput> = match cli.format.as_str() {
        "segments" => Box::new(Segments),
        _ => Box::new(Words::default()),
    };
    formatter.write(&mut writer, &**pipeline.dict(), &hyp, &segments)?;
    writer.flush()?;

    if let Some(path) = &cli.lattice_file {
        let mut f = BufWriter::new(File::create(path)?);
        pipeline.lattice().write_htk(&mut f, &**pipeline.dict())?;
    }
    if let Some(path) = &cli.dot_file {
        let mut f = BufWriter::new(File::create(path)?);
        pipeline.lattice().write_dot(&mut f, &**pipeline.dict())?;
    }

    pipeline.shutdown();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::from_args();

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error loading configuration: {}", e);
            process::exit(1);
        }
    };

    if !cli.demo {
        eprintln!(
            "multisphinx has no built-in acoustic model, dictionary, or language model loader \
             (these are external contracts an embedding application supplies, see DESIGN.md); \
             pass --demo to smoke-test the pipeline against the bundled in-memory fixtures."
        );
        process::exit(1);
    }

    if let Err(e) = run_demo(&cli, config) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
