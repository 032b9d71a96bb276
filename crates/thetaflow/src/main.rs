use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use thetaflow_core::{
    ComparisonOperator, ComparisonPredicate, DataType, DeployedJoin, JoinConfig, JoinSummary, Row,
    ScalarValue, Side, ThetaJoin,
};
use thetaflow_error::{FlowError, Result, ResultExt};
use tracing::{Level, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum JoinOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    /// `|left - right| <= radius`
    Band,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KeyType {
    Int32,
    Int64,
    Timestamp,
}

impl From<KeyType> for DataType {
    fn from(value: KeyType) -> Self {
        match value {
            KeyType::Int32 => DataType::Int32,
            KeyType::Int64 => DataType::Int64,
            KeyType::Timestamp => DataType::Timestamp,
        }
    }
}

#[derive(Parser)]
#[clap(name = "thetaflow")]
struct Arguments {
    /// CSV file with the left relation.
    #[clap(long)]
    left: PathBuf,
    /// CSV file with the right relation.
    #[clap(long)]
    right: PathBuf,
    /// Skip the first line of each file.
    #[clap(long)]
    header: bool,
    #[clap(long, default_value_t = 0)]
    left_column: usize,
    #[clap(long, default_value_t = 0)]
    right_column: usize,
    #[clap(long, value_enum, default_value_t = JoinOp::Eq)]
    op: JoinOp,
    /// Radius for band joins.
    #[clap(long, default_value_t = 0)]
    radius: u64,
    /// Type of the join columns. Required for spilling.
    #[clap(long, value_enum)]
    key_type: Option<KeyType>,
    /// Estimated left cardinality, defaults to the number of rows read.
    #[clap(long)]
    left_cardinality: Option<i64>,
    /// Estimated right cardinality, defaults to the number of rows read.
    #[clap(long)]
    right_cardinality: Option<i64>,
    /// Join setting, may be repeated.
    #[clap(long = "set", value_name = "NAME=VALUE")]
    settings: Vec<String>,
    /// Only print the summary.
    #[clap(long)]
    summary_only: bool,
    #[clap(long)]
    log_json: bool,
    /// Increase log verbosity, may be repeated.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// List available settings and exit.
    #[clap(long)]
    list_settings: bool,
}

fn main() {
    let args = Arguments::parse();

    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let format = if args.log_json {
        logutil::LogFormat::Json
    } else {
        logutil::LogFormat::HumanReadable
    };
    logutil::configure_stderr_logger(level, format);

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("thetaflow")
        .build()
        .context("Failed to build tokio runtime")
        .and_then(|runtime| runtime.block_on(inner(args)));

    if let Err(err) = result {
        println!("ERROR: {err}");
        std::process::exit(1);
    }
}

async fn inner(args: Arguments) -> Result<()> {
    if args.list_settings {
        for (name, description) in JoinConfig::describe() {
            println!("{name:<24}{description}");
        }
        return Ok(());
    }

    let mut config = JoinConfig::default();
    for pair in &args.settings {
        config.set_pair(pair)?;
    }

    let left = read_csv(&args.left, args.header)?;
    let right = read_csv(&args.right, args.header)?;
    let left_cardinality = args.left_cardinality.unwrap_or(left.len().max(1) as i64);
    let right_cardinality = args.right_cardinality.unwrap_or(right.len().max(1) as i64);

    let mut predicate = match args.op {
        JoinOp::Band => ComparisonPredicate::band(args.left_column, args.right_column, args.radius),
        op => {
            let op = match op {
                JoinOp::Eq => ComparisonOperator::Eq,
                JoinOp::Neq => ComparisonOperator::NotEq,
                JoinOp::Lt => ComparisonOperator::Lt,
                JoinOp::Lte => ComparisonOperator::LtEq,
                JoinOp::Gt => ComparisonOperator::Gt,
                _ => ComparisonOperator::GtEq,
            };
            ComparisonPredicate::new(args.left_column, op, args.right_column)
        }
    };
    if let Some(key_type) = args.key_type {
        predicate = predicate.with_key_datatype(key_type.into())?;
    }

    info!(
        left = left.len(),
        right = right.len(),
        left_cardinality,
        right_cardinality,
        "starting join",
    );

    let DeployedJoin {
        input,
        mut output,
        completion,
        ..
    } = ThetaJoin::new(config, predicate).deploy(left_cardinality, right_cardinality)?;

    let feeder = tokio::spawn(async move {
        let mut left = left.into_iter();
        let mut right = right.into_iter();
        loop {
            let l = left.next();
            let r = right.next();
            if l.is_none() && r.is_none() {
                break;
            }
            if let Some(row) = l {
                input.send(Side::Left, row).await?;
            }
            if let Some(row) = r {
                input.send(Side::Right, row).await?;
            }
        }
        input.finish();
        Ok::<_, FlowError>(())
    });

    let mut stdout = BufWriter::new(io::stdout());
    while let Some(m) = output.recv().await {
        if !args.summary_only {
            writeln!(stdout, "{}", m.row)?;
        }
    }
    stdout.flush()?;

    // Report the join failure first, a failed feeder is usually a symptom.
    let summary = completion.wait().await?;
    feeder.await.context("Input task failed")??;

    print_summary(&mut stdout, &summary)?;
    stdout.flush()?;

    Ok(())
}

fn read_csv(path: &Path, header: bool) -> Result<Vec<Row>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(header)
        .flexible(true)
        .from_path(path)
        .context_fn(|| format!("Failed to open '{}'", path.display()))?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context_fn(|| format!("Failed to read '{}'", path.display()))?;
        rows.push(Row::new(record.iter().map(ScalarValue::parse_inferred)));
    }
    Ok(rows)
}

fn print_summary(out: &mut impl Write, summary: &JoinSummary) -> Result<()> {
    writeln!(out, "status: {:?}", summary.status)?;
    writeln!(out, "left tuples: {}", summary.left_tuples)?;
    writeln!(out, "right tuples: {}", summary.right_tuples)?;
    writeln!(out, "matches: {}", summary.matches)?;
    writeln!(out, "faults: {}", summary.faults)?;
    writeln!(out, "spilled: {}", summary.spilled)?;
    writeln!(out, "epochs: {}", summary.epochs)?;
    writeln!(out, "remaps: {}", summary.remaps)?;
    for worker in &summary.workers {
        writeln!(
            out,
            "  worker {}: matches={} imported={} exported={}",
            worker.worker, worker.matches, worker.imported, worker.exported,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_fields_stay_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("left.csv");
        std::fs::write(&path, "id,name\n1,\"a,b\"\n\n2,c\n").unwrap();

        let rows = read_csv(&path, true).unwrap();
        assert_eq!(2, rows.len());
        assert_eq!(2, rows[0].len());
        assert_eq!(&ScalarValue::Int64(1), rows[0].column(0).unwrap());
        assert_eq!(&ScalarValue::Utf8("a,b".into()), rows[0].column(1).unwrap());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = read_csv(Path::new("/nonexistent/thetaflow.csv"), false).unwrap_err();
        assert!(err.to_string().contains("thetaflow.csv"));
    }
}
