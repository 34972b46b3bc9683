use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use treescape::driver::{self, DEFAULT_MAX_MDS_TREES};
use treescape::reader::{self, Format};
use treescape::{Metric, Result, within_chain_dissonance};

/// Tree-set analysis for Bayesian posterior samples: pairwise distance
/// matrices with an MDS embedding, conditional clade distributions, and
/// split-vs-pooled mixing diagnostics.
#[derive(Parser, Debug)]
#[command(name = "treescape", version, about = "Tree-set analysis: distances, MDS, CCD, mixing")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Quiet mode: suppresses phase timing messages on stdout
    #[arg(short = 'q', long = "quiet", global = true, default_value_t = false)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pairwise tree distances and a 2D MDS embedding
    Mds {
        /// Path to a tree file (.nwk / .trees / .nexus, optionally .gz)
        #[arg(short = 'i', long = "input")]
        input: PathBuf,

        /// Input format; `auto` sniffs the first marker bytes
        #[arg(long = "format", value_enum, default_value_t = FormatArg::Auto)]
        format: FormatArg,

        /// Burn-in as a percentage of trees to drop from the front
        #[arg(long = "burnin", default_value_t = 0.0)]
        burnin: f64,

        /// Subsample to at most this many trees (0 = keep all)
        #[arg(long = "max-trees", default_value_t = DEFAULT_MAX_MDS_TREES)]
        max_trees: usize,

        /// Distance metric: rf | spr | path
        #[arg(long = "metric", value_enum, default_value_t = MetricArg::Rf)]
        metric: MetricArg,

        /// Seed for the subsampling shuffle
        #[arg(long = "seed", default_value_t = 42)]
        seed: u64,

        /// Output path for the coordinate TSV (.gz compresses)
        #[arg(short = 'o', long = "output")]
        output: PathBuf,

        /// Also write the distance matrix TSV here
        #[arg(long = "matrix")]
        matrix: Option<PathBuf>,
    },

    /// Conditional clade distribution statistics as JSON
    Ccd {
        /// Path to a tree file (.nwk / .trees / .nexus, optionally .gz)
        #[arg(short = 'i', long = "input")]
        input: PathBuf,

        /// Input format; `auto` sniffs the first marker bytes
        #[arg(long = "format", value_enum, default_value_t = FormatArg::Auto)]
        format: FormatArg,

        /// Burn-in as a percentage of trees to drop from the front
        #[arg(long = "burnin", default_value_t = 10.0)]
        burnin: f64,
    },

    /// Within-chain dissonance (mixing diagnostic) as JSON
    Mixing {
        /// Path to a tree file (.nwk / .trees / .nexus, optionally .gz)
        #[arg(short = 'i', long = "input")]
        input: PathBuf,

        /// Input format; `auto` sniffs the first marker bytes
        #[arg(long = "format", value_enum, default_value_t = FormatArg::Auto)]
        format: FormatArg,

        /// Number of contiguous blocks to split the sample into
        #[arg(long = "splits", default_value_t = 2)]
        splits: usize,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FormatArg {
    Auto,
    Newick,
    Nexus,
    Phyloxml,
    Nexml,
    Phyjson,
}

impl From<FormatArg> for Format {
    fn from(value: FormatArg) -> Format {
        match value {
            FormatArg::Auto => Format::Auto,
            FormatArg::Newick => Format::Newick,
            FormatArg::Nexus => Format::Nexus,
            FormatArg::Phyloxml => Format::PhyloXml,
            FormatArg::Nexml => Format::NeXml,
            FormatArg::Phyjson => Format::PhyJson,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum MetricArg {
    Rf,
    Spr,
    Path,
}

impl From<MetricArg> for Metric {
    fn from(value: MetricArg) -> Metric {
        match value {
            MetricArg::Rf => Metric::RobinsonFoulds,
            MetricArg::Spr => Metric::Spr,
            MetricArg::Path => Metric::Path,
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let quiet = args.quiet;
    match args.command {
        Command::Mds {
            input,
            format,
            burnin,
            max_trees,
            metric,
            seed,
            output,
            matrix,
        } => {
            let trees = read_timed(&input, format.into(), quiet)?;
            let t = Instant::now();
            let mds_run =
                driver::mds_pipeline(&trees, metric.into(), max_trees, burnin, seed, None)?;
            log_if(
                quiet,
                format!(
                    "Embedded {} of {} trees ({} metric) in {:.3}s",
                    mds_run.summary.analyzed_trees,
                    mds_run.summary.input_trees,
                    mds_run.summary.metric,
                    t.elapsed().as_secs_f64()
                ),
            );

            reader::write_coords_tsv(&output, &mds_run.labels, &mds_run.coords)?;
            log_if(quiet, format!("Wrote coordinates to {}", output.display()));
            if let Some(matrix_path) = matrix {
                reader::write_matrix_tsv(&matrix_path, &mds_run.labels, &mds_run.distances)?;
                log_if(
                    quiet,
                    format!("Wrote distance matrix to {}", matrix_path.display()),
                );
            }
            Ok(())
        }
        Command::Ccd {
            input,
            format,
            burnin,
        } => {
            let trees = read_timed(&input, format.into(), quiet)?;
            let t = Instant::now();
            let mut ccd = driver::build_ccd_from_trees(&trees, burnin / 100.0)?;
            let stats = driver::ccd_statistics(&mut ccd);
            log_if(
                quiet,
                format!(
                    "Built CCD over {} trees / {} clades in {:.3}s",
                    stats.number_of_trees,
                    stats.number_of_clades,
                    t.elapsed().as_secs_f64()
                ),
            );
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Mixing {
            input,
            format,
            splits,
        } => {
            let trees = read_timed(&input, format.into(), quiet)?;
            let t = Instant::now();
            let result = within_chain_dissonance(&trees, splits, None)?;
            log_if(
                quiet,
                format!(
                    "Dissonance over {splits} splits in {:.3}s",
                    t.elapsed().as_secs_f64()
                ),
            );
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

fn read_timed(input: &PathBuf, format: Format, quiet: bool) -> Result<Vec<treescape::Tree>> {
    let t = Instant::now();
    let trees = reader::read_trees_file(input, format)?;
    log_if(
        quiet,
        format!(
            "Read {} trees from {} in {:.3}s",
            trees.len(),
            input.display(),
            t.elapsed().as_secs_f64()
        ),
    );
    Ok(trees)
}

fn log_if(quiet: bool, msg: String) {
    if !quiet {
        println!("{}", msg);
    }
}
