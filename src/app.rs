//! Subcommand implementations.

use std::io::Write;
use std::path::PathBuf;

use tokio::io::BufReader;

use crate::cli::{Command, CommandLineArgs, DatasetArgs, ReduceArgs};
use crate::dataset::LogicalDataset;
use crate::error::ReductionError;
use crate::pipeline::reduce_dataset_with;
use crate::planner::plan;
use crate::worker;

/// Run the subcommand selected on the command line.
pub async fn run(args: CommandLineArgs) -> Result<(), ReductionError> {
    match args.command {
        Command::Reduce(args) => reduce(&args).await,
        Command::Plan(args) => print_plan(&args),
        Command::Worker => {
            worker::serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
        }
    }
}

/// Reduce a dataset and write the result as JSON.
///
/// The result goes to the output file if one was given, otherwise to stdout. A one line summary
/// is written to stderr.
async fn reduce(args: &ReduceArgs) -> Result<(), ReductionError> {
    let config = args.pipeline_config()?;
    let reduction =
        reduce_dataset_with(args.operation, &args.dataset.files, &args.dims, &config).await?;
    let json = serde_json::to_string_pretty(&reduction.to_json()?)?;
    match &args.output {
        Some(path) => std::fs::write(path, json).map_err(|source| ReductionError::OutputWrite {
            path: path.clone(),
            source,
        })?,
        None => println!("{}", json),
    }
    eprintln!("{}", reduction.summary()?);
    Ok(())
}

/// Print one JSON line per chunk of the dataset.
fn print_plan(args: &DatasetArgs) -> Result<(), ReductionError> {
    let dataset = LogicalDataset::open(&args.files, args.concat_dim.as_deref())?;
    let descriptors = plan(&dataset, args.chunk_size)?;
    let mut stdout = std::io::stdout().lock();
    for descriptor in &descriptors {
        serde_json::to_writer(&mut stdout, descriptor)?;
        writeln!(stdout).map_err(|source| ReductionError::OutputWrite {
            path: PathBuf::from("-"),
            source,
        })?;
    }
    Ok(())
}
