// Command line utility for running the scflow pipeline and its stages

use anyhow::{Context, Error};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::info;
use scflow::config::PipelineConfig;
use scflow::{Experiment, Pipeline};
use std::path::PathBuf;

fn object_arg() -> Arg {
    Arg::new("OBJECT")
        .help("Saved analysis object (.json.gz)")
        .required(true)
        .index(1)
        .value_parser(value_parser!(PathBuf))
}

fn load_config(matches: &ArgMatches) -> Result<PipelineConfig, Error> {
    let mut config = match matches.get_one::<PathBuf>("CONFIG") {
        Some(path) => PipelineConfig::from_json(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = matches.get_one::<PathBuf>("OUT_DIR") {
        config.output.results_dir = dir.clone();
    }
    if let Some(&res) = matches.get_one::<f64>("RESOLUTION") {
        if !config.clustering.resolutions.contains(&res) {
            config.clustering.resolutions.push(res);
        }
        config.clustering.active_resolution = res;
    }
    config.validate()?;
    Ok(config)
}

/// Load a saved object and switch it to the requested resolution, if any.
fn load_object(matches: &ArgMatches, config: &PipelineConfig) -> Result<Experiment, Error> {
    let path: &PathBuf = matches
        .get_one("OBJECT")
        .context("missing object path")?;
    let mut exp = Experiment::load(path)?;
    if !exp.clusters.is_empty() {
        exp.set_idents(config.clustering.active_resolution)?;
    }
    Ok(exp)
}

pub fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = Command::new("scflow-cmd")
        .about("Two-condition single cell RNA-seq analysis")
        .subcommand_required(true)
        .arg(
            Arg::new("CONFIG")
                .help("JSON pipeline settings; defaults are used when omitted")
                .short('c')
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("OUT_DIR")
                .help("Output directory, overrides the configured one")
                .short('o')
                .long("out-dir")
                .global(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("THREADS")
                .help("Number of worker threads")
                .short('t')
                .long("threads")
                .global(true)
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("RESOLUTION")
                .help("Clustering resolution used for the cluster labels")
                .short('r')
                .long("resolution")
                .global(true)
                .value_parser(value_parser!(f64)),
        )
        .subcommand(Command::new("run").about("Run every stage"))
        .subcommand(Command::new("qc").about("Load, merge and filter the samples"))
        .subcommand(
            Command::new("markers")
                .about("Conserved and pairwise markers of a clustered object")
                .arg(object_arg()),
        )
        .subcommand(
            Command::new("embed")
                .about("Write the UMAP and PCA tables of a clustered object")
                .arg(object_arg())
                .arg(
                    Arg::new("RECLUSTER")
                        .help("Recompute PCA, UMAP and clusters from the integrated data")
                        .long("recluster")
                        .action(ArgAction::SetTrue),
                ),
        )
        .get_matches();

    let (name, sub) = matches.subcommand().context("no subcommand")?;
    if let Some(&threads) = sub.get_one::<usize>("THREADS") {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("setting up the thread pool")?;
    }
    let config = load_config(sub)?;
    info!("writing results to {}", config.output.results_dir.display());
    let pipeline = Pipeline::new(config);

    match name {
        "run" => {
            let exp = pipeline.run()?;
            info!("{} cells in the labelled object", exp.num_cells());
        }
        "qc" => {
            pipeline.qc()?;
        }
        "markers" => {
            let exp = load_object(sub, pipeline.config())?;
            let rows = pipeline.markers(&exp)?;
            info!("{} conserved markers", rows.len());
        }
        "embed" => {
            let exp = load_object(sub, pipeline.config())?;
            if sub.get_flag("RECLUSTER") {
                let exp = pipeline.cluster(exp)?;
                info!("{} clusterings", exp.clusters.len());
            } else {
                pipeline.write_embeddings(&exp)?;
            }
        }
        other => unreachable!("unknown subcommand {other}"),
    }
    Ok(())
}
