//! lineage-cli: command-line client for a running Lineage node.
//!
//! Registers people and relationships, seeds distributions, applies
//! payments, and prints balances over JSON-RPC. Amounts are entered and
//! shown in major units with two decimals (e.g. `12.50`).

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use serde_json::Value;
use tracing::debug;

use lineage_core::amount::{format_amount, format_signed, parse_amount};
use lineage_core::constants::DEFAULT_RPC_PORT;
use lineage_core::types::ObligationKind;

/// Lineage command-line client.
#[derive(Parser)]
#[command(name = "lineage-cli")]
#[command(version, about = "Generational debt and credit ledger client")]
struct Cli {
    /// RPC endpoint URL.
    #[arg(short, long, global = true, default_value_t = format!("http://127.0.0.1:{DEFAULT_RPC_PORT}"))]
    rpc_endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a person.
    AddPerson {
        id: u64,
    },
    /// Record that `child` descends from `parent`.
    AddEdge {
        parent: u64,
        child: u64,
    },
    /// Distribute an amount from a root down its descendants.
    Distribute(DistributeArgs),
    /// Void the active run for a root and distribute a new amount.
    Redistribute(DistributeArgs),
    /// Void a distribution run.
    VoidRun {
        /// Hex run id.
        run_id: String,
    },
    /// Apply a payment between two people.
    Pay(PayArgs),
    /// Sum of a person's active outstanding balances.
    Outstanding {
        person: u64,
        #[arg(short, long, default_value = "debt", value_parser = parse_kind)]
        kind: ObligationKind,
    },
    /// Debt, credit, and net position of a person.
    Balance {
        person: u64,
    },
    /// List a person's obligation records.
    Records {
        person: u64,
        #[arg(short, long, default_value = "debt", value_parser = parse_kind)]
        kind: ObligationKind,
        /// Include records from voided runs.
        #[arg(long)]
        include_voided: bool,
    },
    /// List payments involving a person, newest first.
    Payments {
        person: u64,
    },
    /// Show a distribution run with its totals.
    Run {
        run_id: String,
    },
}

#[derive(Args)]
struct DistributeArgs {
    /// Root person id.
    root: u64,

    /// Amount in major units (e.g., 1000.00).
    #[arg(value_parser = parse_amount_arg)]
    amount: u64,

    /// "debt" or "credit".
    #[arg(short, long, default_value = "debt", value_parser = parse_kind)]
    kind: ObligationKind,

    /// Override the node's maximum generation depth.
    #[arg(long)]
    max_depth: Option<u32>,
}

#[derive(Args)]
struct PayArgs {
    /// Paying person id.
    #[arg(long)]
    payer: u64,

    /// Receiving person id.
    #[arg(long)]
    recipient: u64,

    /// Amount in major units (e.g., 10.50).
    #[arg(short, long, value_parser = parse_amount_arg)]
    amount: u64,

    /// Unique external reference (bank transfer id, receipt number).
    #[arg(long = "ref")]
    external_ref: String,

    /// Event time in Unix milliseconds (default: now).
    #[arg(long)]
    timestamp: Option<i64>,

    /// Overpayment handling: clamp, allow, or reject (default: node setting).
    #[arg(long)]
    policy: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let client = HttpClientBuilder::default()
        .build(&cli.rpc_endpoint)
        .context("Failed to connect to RPC")?;
    debug!(endpoint = %cli.rpc_endpoint, "rpc client ready");

    match cli.command {
        Commands::AddPerson { id } => add_person(&client, id).await,
        Commands::AddEdge { parent, child } => add_edge(&client, parent, child).await,
        Commands::Distribute(args) => distribute(&client, "distribute", args).await,
        Commands::Redistribute(args) => distribute(&client, "redistribute", args).await,
        Commands::VoidRun { run_id } => void_run(&client, run_id).await,
        Commands::Pay(args) => pay(&client, args).await,
        Commands::Outstanding { person, kind } => outstanding(&client, person, kind).await,
        Commands::Balance { person } => balance(&client, person).await,
        Commands::Records {
            person,
            kind,
            include_voided,
        } => records(&client, person, kind, include_voided).await,
        Commands::Payments { person } => payments(&client, person).await,
        Commands::Run { run_id } => show_run(&client, run_id).await,
    }
}

async fn add_person(client: &HttpClient, id: u64) -> Result<()> {
    let mut params = ArrayParams::new();
    params.insert(id)?;
    let created: bool = client
        .request("addperson", params)
        .await
        .context("RPC addperson failed")?;
    if created {
        println!("Registered person {id}");
    } else {
        println!("Person {id} already registered");
    }
    Ok(())
}

async fn add_edge(client: &HttpClient, parent: u64, child: u64) -> Result<()> {
    if parent == child {
        bail!("A person cannot be their own parent");
    }
    let mut params = ArrayParams::new();
    params.insert(parent)?;
    params.insert(child)?;
    let _: Value = client
        .request("addedge", params)
        .await
        .context("RPC addedge failed")?;
    println!("{parent} -> {child}");
    Ok(())
}

async fn distribute(client: &HttpClient, method: &str, args: DistributeArgs) -> Result<()> {
    let mut params = ArrayParams::new();
    params.insert(args.root)?;
    params.insert(args.amount)?;
    params.insert(args.kind.as_str())?;
    params.insert(args.max_depth)?;
    let report: Value = client
        .request(method, params)
        .await
        .with_context(|| format!("RPC {method} failed"))?;

    print_run(&report["run"]);
    println!(
        "Records:      {} ({} new, {} existing)",
        report["records"].as_array().map_or(0, Vec::len),
        report["inserted"].as_u64().unwrap_or(0),
        report["skipped"].as_u64().unwrap_or(0),
    );
    if let Some(warnings) = report["warnings"].as_array() {
        for warning in warnings {
            println!("Warning:      {warning}");
        }
    }
    if let Some(reason) = report["halted"].as_str() {
        println!("Halted:       {reason} (run the same command again to resume)");
    }
    println!();
    for record in report["records"].as_array().into_iter().flatten() {
        print_record(record);
    }
    Ok(())
}

async fn void_run(client: &HttpClient, run_id: String) -> Result<()> {
    let mut params = ArrayParams::new();
    params.insert(run_id)?;
    let run: Value = client
        .request("voidrun", params)
        .await
        .context("RPC voidrun failed")?;
    print_run(&run);
    Ok(())
}

async fn pay(client: &HttpClient, args: PayArgs) -> Result<()> {
    let external_ref = args.external_ref.trim().to_string();
    if external_ref.is_empty() {
        bail!("External reference must not be empty");
    }
    let mut params = ArrayParams::new();
    params.insert(args.payer)?;
    params.insert(args.recipient)?;
    params.insert(args.amount)?;
    params.insert(external_ref)?;
    params.insert(args.timestamp)?;
    params.insert(args.policy)?;
    let outcome: Value = client
        .request("applypayment", params)
        .await
        .context("RPC applypayment failed")?;

    println!("Payment:      {}", outcome["payment"]["payment_id"].as_str().unwrap_or_default());
    println!("Amount:       {}", format_amount(args.amount));
    print_leg("Debit", &outcome["debit"]);
    print_leg("Credit", &outcome["credit"]);
    Ok(())
}

async fn outstanding(client: &HttpClient, person: u64, kind: ObligationKind) -> Result<()> {
    let mut params = ArrayParams::new();
    params.insert(person)?;
    params.insert(kind.as_str())?;
    let total: i128 = client
        .request("getoutstanding", params)
        .await
        .context("RPC getoutstanding failed")?;
    println!("{} outstanding for {person}: {}", kind, format_signed(total));
    Ok(())
}

async fn balance(client: &HttpClient, person: u64) -> Result<()> {
    let mut params = ArrayParams::new();
    params.insert(person)?;
    let balance: Value = client
        .request("getbalance", params)
        .await
        .context("RPC getbalance failed")?;
    let field = |name: &str| balance[name].as_i64().map(i128::from).unwrap_or(0);
    println!("Person:       {person}");
    println!("Debt:         {}", format_signed(field("debt_outstanding")));
    println!("Credit:       {}", format_signed(field("credit_outstanding")));
    println!("Net:          {}", format_signed(field("net")));
    println!("Open records: {}", balance["open_records"].as_u64().unwrap_or(0));
    Ok(())
}

async fn records(
    client: &HttpClient,
    person: u64,
    kind: ObligationKind,
    include_voided: bool,
) -> Result<()> {
    let mut params = ArrayParams::new();
    params.insert(person)?;
    params.insert(kind.as_str())?;
    params.insert(include_voided)?;
    let records: Vec<Value> = client
        .request("getrecords", params)
        .await
        .context("RPC getrecords failed")?;
    if records.is_empty() {
        println!("No {kind} records for {person}");
    }
    for record in &records {
        print_record(record);
    }
    Ok(())
}

async fn payments(client: &HttpClient, person: u64) -> Result<()> {
    let mut params = ArrayParams::new();
    params.insert(person)?;
    let payments: Vec<Value> = client
        .request("getpayments", params)
        .await
        .context("RPC getpayments failed")?;
    if payments.is_empty() {
        println!("No payments for {person}");
    }
    for p in &payments {
        println!(
            "{}  {} -> {}  {:>14}  ref={}",
            p["timestamp"].as_i64().unwrap_or(0),
            p["payer_id"].as_u64().unwrap_or(0),
            p["recipient_id"].as_u64().unwrap_or(0),
            format_amount(p["amount"].as_u64().unwrap_or(0)),
            p["external_ref"].as_str().unwrap_or_default(),
        );
    }
    Ok(())
}

async fn show_run(client: &HttpClient, run_id: String) -> Result<()> {
    let mut params = ArrayParams::new();
    params.insert(run_id)?;
    let summary: Value = client
        .request("getrun", params)
        .await
        .context("RPC getrun failed")?;
    print_run(&summary["run"]);
    let wide = |name: &str| summary[name].as_i64().map(i128::from).unwrap_or(0);
    println!("Inherited:    {}", format_signed(wide("total_inherited")));
    println!("Paid:         {}", format_signed(wide("total_paid")));
    println!("Outstanding:  {}", format_signed(wide("total_outstanding")));
    println!(
        "Settled:      {} of {}",
        summary["settled_records"].as_u64().unwrap_or(0),
        summary["record_count"].as_u64().unwrap_or(0),
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn print_run(run: &Value) {
    println!("Run:          {}", run["run_id"].as_str().unwrap_or_default());
    println!(
        "Root:         {} ({}, {})",
        run["root_id"].as_u64().unwrap_or(0),
        run["kind"].as_str().unwrap_or_default(),
        format_amount(run["root_amount"].as_u64().unwrap_or(0)),
    );
    println!("Status:       {}", run["status"].as_str().unwrap_or_default());
    let unresolved = run["unresolved_total"].as_u64().unwrap_or(0);
    if unresolved > 0 {
        println!("Unresolved:   {} (depth bound)", format_amount(unresolved));
    }
}

fn print_record(record: &Value) {
    println!(
        "g{:<3} {:>6} -> {:<6} {:>14} paid {:>14} outstanding {:>14}  [{}]",
        record["generation"].as_u64().unwrap_or(0),
        record["parent_id"].as_u64().unwrap_or(0),
        record["descendant_id"].as_u64().unwrap_or(0),
        format_amount(record["inherited_portion"].as_u64().unwrap_or(0)),
        format_amount(record["amount_paid"].as_u64().unwrap_or(0)),
        format_signed(record["amount_outstanding"].as_i64().map(i128::from).unwrap_or(0)),
        record["status"].as_str().unwrap_or_default(),
    );
}

fn print_leg(label: &str, leg: &Value) {
    if leg.is_null() {
        println!("{label:<6}        no open record matched");
        return;
    }
    let record = &leg["record"];
    println!(
        "{label:<6}        applied {} to {} -> {} (g{}), outstanding now {}",
        format_amount(leg["applied"].as_u64().unwrap_or(0)),
        record["parent_id"].as_u64().unwrap_or(0),
        record["descendant_id"].as_u64().unwrap_or(0),
        record["generation"].as_u64().unwrap_or(0),
        format_signed(record["amount_outstanding"].as_i64().map(i128::from).unwrap_or(0)),
    );
    let unapplied = leg["unapplied"].as_u64().unwrap_or(0);
    if unapplied > 0 {
        println!("              unapplied {}", format_amount(unapplied));
    }
    let overpaid = leg["overpaid"].as_u64().unwrap_or(0);
    if overpaid > 0 {
        println!("              overpaid {}", format_amount(overpaid));
    }
}

fn parse_amount_arg(s: &str) -> Result<u64, String> {
    parse_amount(s).map_err(|e| e.to_string())
}

fn parse_kind(s: &str) -> Result<ObligationKind, String> {
    s.parse::<ObligationKind>().map_err(|e| e.to_string())
}
