use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use warden_core::{DlqItemId, KillSwitchActor, RunId, SnapshotId};
use warden_runtime::{GovernanceContext, Governor, WardenConfig, DEFAULT_CONFIG_FILE};

fn cli() -> Command {
    Command::new("warden")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Governance and recovery layer for autonomous agent operations")
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Config file (defaults to ./warden.toml when present)"),
        )
        .subcommand(
            Command::new("snapshot")
                .about("Capture, compare and collect working-tree snapshots")
                .subcommand_required(true)
                .subcommand(
                    Command::new("capture")
                        .about("Capture the configured root")
                        .arg(
                            Arg::new("label")
                                .long("label")
                                .default_value("manual")
                                .help("Snapshot label"),
                        ),
                )
                .subcommand(
                    Command::new("diff")
                        .about("Diff a snapshot against another or the current tree")
                        .arg(Arg::new("before").required(true).help("Before snapshot id"))
                        .arg(Arg::new("after").help("After snapshot id; captures the tree when omitted")),
                )
                .subcommand(
                    Command::new("gc")
                        .about("Expire old snapshots and purge expired ones")
                        .arg(
                            Arg::new("grace-hours")
                                .long("grace-hours")
                                .default_value("24")
                                .value_parser(value_parser!(u32))
                                .help("Hours an expired snapshot stays marked before purge"),
                        ),
                ),
        )
        .subcommand(
            Command::new("preflight")
                .about("Assess paths against the risk domains")
                .arg(Arg::new("paths").required(true).num_args(1..).help("Relative paths")),
        )
        .subcommand(
            Command::new("kill-switch")
                .about("Inspect or set the global kill switch")
                .subcommand_required(true)
                .subcommand(Command::new("status").about("Show kill switch state"))
                .subcommand(
                    Command::new("activate")
                        .about("Stop all new work")
                        .arg(
                            Arg::new("reason")
                                .long("reason")
                                .required(true)
                                .help("Reason recorded with the switch"),
                        ),
                )
                .subcommand(Command::new("deactivate").about("Allow work to resume")),
        )
        .subcommand(
            Command::new("budget")
                .about("Inspect run budgets")
                .subcommand_required(true)
                .subcommand(
                    Command::new("show")
                        .about("Show a run's budget state")
                        .arg(Arg::new("run").required(true).help("Run id")),
                ),
        )
        .subcommand(
            Command::new("dlq")
                .about("Inspect and reprocess the dead-letter queue")
                .subcommand_required(true)
                .subcommand(
                    Command::new("list")
                        .about("List queued items")
                        .arg(Arg::new("run").long("run").help("Only items of this run")),
                )
                .subcommand(
                    Command::new("reprocess")
                        .about("Make an item due again")
                        .arg(Arg::new("id").required(true).help("Dead-letter item id"))
                        .arg(
                            Arg::new("max-retries")
                                .long("max-retries")
                                .value_parser(value_parser!(u32))
                                .help("Retries granted (at least one)"),
                        ),
                )
                .subcommand(
                    Command::new("discard")
                        .about("Drop an item without retrying it")
                        .arg(Arg::new("id").required(true).help("Dead-letter item id")),
                )
                .subcommand(Command::new("rebuild-index").about("Regenerate dlq/index.json")),
        )
        .subcommand(
            Command::new("policy")
                .about("Validate policy documents")
                .subcommand_required(true)
                .subcommand(
                    Command::new("check")
                        .about("Parse and validate documents without installing them")
                        .arg(Arg::new("documents").required(true).num_args(1..).value_parser(value_parser!(PathBuf)))
                        .arg(
                            Arg::new("quiet")
                                .long("quiet")
                                .short('q')
                                .action(ArgAction::SetTrue)
                                .help("Only report failures"),
                        ),
                ),
        )
        .subcommand(
            Command::new("audit")
                .about("Governance audit chain")
                .subcommand_required(true)
                .subcommand(Command::new("verify").about("Verify the hash chain end to end")),
        )
}

fn load_config(path: Option<&PathBuf>) -> Result<WardenConfig> {
    match path {
        Some(path) => {
            let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
            Ok(WardenConfig::load(path)?.relative_to(&base))
        }
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => Ok(WardenConfig::load(DEFAULT_CONFIG_FILE)?),
        None => Ok(WardenConfig::default()),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a String> {
    args.get_one::<String>(name)
        .with_context(|| format!("missing argument '{name}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config(matches.get_one::<PathBuf>("config"))?;
    warden_core::telemetry::init(&config.telemetry)?;

    // Document checks must not require the configured documents to load
    if let Some(("policy", sub)) = matches.subcommand() {
        return policy_command(&config, sub).await;
    }

    let ctx = GovernanceContext::from_config(config).await?;
    let result = run(&ctx, &matches).await;
    ctx.shutdown().await;
    result
}

async fn run(ctx: &Arc<GovernanceContext>, matches: &ArgMatches) -> Result<()> {
    let governor = Governor::new(Arc::clone(ctx));
    match matches.subcommand() {
        Some(("snapshot", sub)) => match sub.subcommand() {
            Some(("capture", args)) => {
                let snapshot = ctx.snapshots.capture(required(args, "label")?).await?;
                print_json(&json!({
                    "id": snapshot.id,
                    "label": snapshot.label,
                    "files": snapshot.file_count(),
                    "revision": snapshot.revision,
                    "branch": snapshot.branch,
                }))
            }
            Some(("diff", args)) => {
                let before = ctx
                    .snapshots
                    .load(&SnapshotId::new(required(args, "before")?.as_str()))
                    .await?;
                let after = match args.get_one::<String>("after") {
                    Some(id) => ctx.snapshots.load(&SnapshotId::new(id.as_str())).await?,
                    None => ctx.snapshots.capture("cli:diff").await?,
                };
                print_json(&ctx.verifier.diff(&before, &after))
            }
            Some(("gc", args)) => {
                let hours = args.get_one::<u32>("grace-hours").copied().unwrap_or(24);
                let report = governor
                    .collect_garbage(chrono::Duration::hours(i64::from(hours)))
                    .await?;
                print_json(&report)
            }
            _ => unreachable!("subcommand_required"),
        },
        Some(("preflight", args)) => {
            let paths: Vec<&String> = args.get_many::<String>("paths").into_iter().flatten().collect();
            print_json(&governor.preflight(&paths))
        }
        Some(("kill-switch", sub)) => {
            let state = match sub.subcommand() {
                Some(("status", _)) => ctx.budget.kill_switch_state().await?,
                Some(("activate", args)) => {
                    ctx.budget
                        .activate_kill_switch(required(args, "reason")?, KillSwitchActor::Operator)
                        .await?
                }
                Some(("deactivate", _)) => ctx.budget.deactivate_kill_switch(KillSwitchActor::Operator).await?,
                _ => unreachable!("subcommand_required"),
            };
            print_json(&state)
        }
        Some(("budget", sub)) => match sub.subcommand() {
            Some(("show", args)) => {
                let state = ctx.budget.state(&RunId::new(required(args, "run")?.as_str())).await?;
                print_json(&state)
            }
            _ => unreachable!("subcommand_required"),
        },
        Some(("dlq", sub)) => match sub.subcommand() {
            Some(("list", args)) => {
                let run = args.get_one::<String>("run").map(|r| RunId::new(r.as_str()));
                let items = ctx.dlq.list(run.as_ref()).await;
                let stats = ctx.dlq.stats(run.as_ref()).await;
                print_json(&json!({ "stats": stats, "items": items }))
            }
            Some(("reprocess", args)) => {
                let id = DlqItemId::new(required(args, "id")?.as_str());
                let item = ctx
                    .dlq
                    .reprocess(&id, args.get_one::<u32>("max-retries").copied())
                    .await?;
                print_json(&item)
            }
            Some(("discard", args)) => {
                let item = ctx.dlq.discard(&DlqItemId::new(required(args, "id")?.as_str())).await?;
                print_json(&item)
            }
            Some(("rebuild-index", _)) => {
                let indexed = ctx.dlq.rebuild_index().await?;
                print_json(&json!({ "indexed": indexed }))
            }
            _ => unreachable!("subcommand_required"),
        },
        Some(("audit", sub)) => match sub.subcommand() {
            Some(("verify", _)) => {
                let records = ctx.audit.verify_integrity().await?;
                print_json(&json!({ "verified": true, "records": records }))
            }
            _ => unreachable!("subcommand_required"),
        },
        _ => unreachable!("arg_required_else_help"),
    }
}

async fn policy_command(config: &WardenConfig, matches: &ArgMatches) -> Result<()> {
    let Some(("check", args)) = matches.subcommand() else {
        unreachable!("subcommand_required");
    };
    let quiet = args.get_flag("quiet");
    let loader = warden_policy::PolicyLoader::new(&config.policy);

    let mut failures = 0usize;
    for path in args.get_many::<PathBuf>("documents").into_iter().flatten() {
        match loader.load_path(path).await {
            Ok(document) => {
                if !quiet {
                    let names: Vec<&str> = document.policies.iter().map(|p| p.name.as_str()).collect();
                    print_json(&json!({
                        "document": path,
                        "valid": true,
                        "policies": names,
                        "metrics": document.metrics.len(),
                    }))?;
                }
            }
            Err(e) => {
                failures += 1;
                print_json(&json!({ "document": path, "valid": false, "error": e.to_string() }))?;
            }
        }
    }
    if failures > 0 {
        bail!("{failures} policy document(s) failed validation");
    }
    Ok(())
}
