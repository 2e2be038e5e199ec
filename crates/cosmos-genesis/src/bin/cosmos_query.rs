use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use cosmos_genesis::{
    Capability, ClientOptions, CosmosClient, CosmosError, ExecutionRequest, QueryBuilder,
    SortDirection,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Run queries against Cosmos Genesis simulation data from the command line.
///
/// Results are printed to stdout as JSON; logs go to stderr (`RUST_LOG` controls verbosity).
#[derive(Parser, Debug)]
#[command(name = "cosmos-query", version, about = "Query Cosmos Genesis simulation data")]
struct Args {
    /// Config file to load instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// API key; falls back to COSMOS_API_KEY
    #[arg(long, global = true)]
    api_key: Option<String>,

    #[arg(long, global = true)]
    region: Option<String>,

    #[arg(long, global = true)]
    database: Option<String>,

    /// Upper bound on how long to wait for a query, in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run SQL against one galaxy
    Query {
        galaxy_id: String,
        sql: String,
        /// Restrict to one universe time in Myr; 0 means unfiltered
        #[arg(long, default_value_t = 0)]
        universe_time: u64,
    },
    /// List galaxies with their star system counts
    ListGalaxies,
    /// Render SQL from builder parts without running it
    Build {
        #[arg(long = "select", required = true, num_args = 1.., value_delimiter = ',')]
        fields: Vec<String>,
        #[arg(long = "from")]
        table: String,
        #[arg(long = "where")]
        conditions: Vec<String>,
        #[arg(long)]
        order_by: Option<String>,
        #[arg(long, requires = "order_by")]
        desc: bool,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        offset: Option<i64>,
    },
    /// Show the SQL that would be submitted for a galaxy
    Rewrite {
        galaxy_id: String,
        sql: String,
        #[arg(long, default_value_t = 0)]
        universe_time: u64,
    },
    /// Print the effective configuration as TOML (the API key is never printed)
    PrintConfig,
    /// List optional capabilities and whether this build supports them
    Capabilities,
}

fn main() -> ExitCode {
    init_tracing();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), CosmosError> {
    match args.command {
        Command::Build {
            ref fields,
            ref table,
            ref conditions,
            ref order_by,
            desc,
            limit,
            offset,
        } => {
            let mut builder = QueryBuilder::new()
                .select(fields.iter().cloned())
                .from_table(table.as_str());
            for condition in conditions {
                builder = builder.and_where(condition.as_str());
            }
            if let Some(field) = order_by {
                let direction = if desc {
                    SortDirection::Desc
                } else {
                    SortDirection::Asc
                };
                builder = builder.order_by_dir(field.as_str(), direction);
            }
            if let Some(n) = limit {
                builder = builder.limit(n);
            }
            if let Some(n) = offset {
                builder = builder.offset(n);
            }
            println!("{}", builder.build()?);
            return Ok(());
        }
        Command::Rewrite {
            ref galaxy_id,
            ref sql,
            universe_time,
        } => {
            let request = ExecutionRequest::new(galaxy_id.as_str(), sql.as_str(), universe_time);
            println!("{}", request.effective_sql());
            return Ok(());
        }
        Command::Capabilities => {
            for cap in Capability::ALL {
                println!("{cap}: {:?}", cap.availability());
            }
            return Ok(());
        }
        _ => {}
    }

    let options = load_options(&args)?;
    if let Command::PrintConfig = args.command {
        let rendered = toml::to_string_pretty(&options)
            .map_err(|e| CosmosError::Config(format!("failed to render config: {e}")))?;
        print!("{rendered}");
        return Ok(());
    }

    let client = CosmosClient::new(options)?;
    let json = match &args.command {
        Command::Query {
            galaxy_id,
            sql,
            universe_time,
        } => {
            info!(galaxy_id = %galaxy_id, universe_time, "running query");
            let result = client.query_galaxy(galaxy_id, sql, *universe_time)?;
            info!(rows = result.len(), "query finished");
            serde_json::to_string_pretty(&result)
        }
        Command::ListGalaxies => serde_json::to_string_pretty(&client.list_galaxies()?),
        _ => return Ok(()),
    }
    .map_err(|e| CosmosError::Config(format!("failed to render results: {e}")))?;
    println!("{json}");
    Ok(())
}

fn load_options(args: &Args) -> Result<ClientOptions, CosmosError> {
    let mut options = ClientOptions::load(args.config.as_deref())?;
    if let Some(key) = &args.api_key {
        options = options.with_api_key(key.as_str());
    }
    if let Some(region) = &args.region {
        options = options.with_region(region.as_str());
    }
    if let Some(database) = &args.database {
        options = options.with_database(database.as_str());
    }
    if let Some(secs) = args.timeout_secs {
        options = options.with_timeout(std::time::Duration::from_secs(secs));
    }
    Ok(options)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}
