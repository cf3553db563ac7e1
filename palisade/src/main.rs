#![forbid(unsafe_code)]

use palisade_config::ConfigManager;
use palisade_core::{
    apply_static_rules, BlockList, DynamicQueueManager, EventWriter, FirewallEngine,
    FirewallEvent, Rule, RuleSpec, VerdictHandle, VerdictStatus,
};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

mod filter;
use filter::IptablesFilter;

fn main() {
    let mut args = std::env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_usage_and_exit();
        return;
    };

    let result = match cmd.as_str() {
        "run" => cmd_run(args.collect()),
        "replay" => cmd_replay(args.collect()),
        "add-rule" => cmd_add_rule(args.collect()),
        "remove-rule" => cmd_remove_rule(args.collect()),
        "list-rules" => cmd_list_rules(args.collect()),
        "validate-rules" => cmd_validate_rules(args.collect()),
        "show-blocklist" => cmd_show_blocklist(args.collect()),
        "apply-filter" => cmd_apply_filter(args.collect()),
        "flush-filter" => cmd_flush_filter(args.collect()),
        "config-status" => cmd_config_status(args.collect()),
        "rollback-config" => cmd_rollback_config(args.collect()),
        "show-config-root" => {
            println!("{}", ConfigManager::default_root().display());
            Ok(())
        }
        _ => Err(format!("Unknown command: {}", cmd)),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Verdict sink for file-driven packet streams: there is no kernel queue to
/// release the packet back to.
struct ReplayVerdict;

impl VerdictHandle for ReplayVerdict {
    fn accept(self) {}
    fn drop(self) {}
}

/// Identity flags shared by `run` and `replay`.
#[derive(Debug, Default)]
struct IdentityFlags {
    synapse_names: Vec<String>,
    min_version: Option<u64>,
    whitelist: Vec<String>,
    blacklist: Vec<String>,
}

fn cmd_run(args: Vec<String>) -> Result<(), String> {
    let mut file_path: Option<String> = None;
    let mut rules_path: Option<String> = None;
    let mut root: Option<String> = None;
    let mut queue_num: u16 = 1;
    let mut sweep_interval: u64 = 60;
    let mut install_filter = false;
    let mut identity = IdentityFlags::default();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--file" => file_path = iter.next().cloned(),
            "--rules" => rules_path = iter.next().cloned(),
            "--config-root" => root = iter.next().cloned(),
            "--queue-num" => {
                queue_num = iter
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or("invalid queue number")?
            }
            "--sweep-interval" => {
                sweep_interval = iter
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or("invalid sweep interval")?
            }
            "--apply-filter" => install_filter = true,
            other => {
                if !parse_identity_flag(other, &mut iter, &mut identity)? {
                    return Err(format!("Unknown flag {other}"));
                }
            }
        }
    }
    let file_path = file_path.ok_or("Missing --file <packet lines, or - for stdin>")?;

    init_tracing();
    let mgr = manager(root)?;
    let rules_path = rules_file(&mgr, rules_path)?;
    let specs = load_rule_specs(&rules_path)?;

    if install_filter {
        let rules = compile_rules(&specs)?;
        let mut filter = IptablesFilter::new();
        apply_static_rules(&mut filter, &rules, queue_num)
            .map_err(|e| format!("install kernel rules: {e}"))?;
        tracing::info!(rules = rules.len(), queue = queue_num, "kernel filter installed");
    }

    let blocklist = BlockList::load(&mgr.paths.blocklist)
        .map_err(|e| format!("load block list: {e}"))?;
    tracing::info!(
        rules = specs.len(),
        blocked = blocklist.len(),
        "starting packet processing"
    );
    let blocklist = Arc::new(Mutex::new(blocklist));
    let queue = Arc::new(DynamicQueueManager::new(1024));
    let mut engine = FirewallEngine::new(Arc::clone(&blocklist), Arc::clone(&queue));
    engine
        .update(&specs, &identity.whitelist, &identity.blacklist)
        .map_err(|e| e.0)?;
    engine.set_identity_requirements(identity.synapse_names, identity.min_version);

    let stop = Arc::new(AtomicBool::new(false));
    let consumer = spawn_consumer(
        Arc::clone(&queue),
        Arc::clone(&blocklist),
        mgr.paths.blocklist.clone(),
        mgr.paths.events_log.clone(),
        Arc::clone(&stop),
    )?;

    let reader: Box<dyn BufRead> = if file_path == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = File::open(&file_path).map_err(|e| format!("open packet file: {e}"))?;
        Box::new(BufReader::new(file))
    };

    let mut total = 0usize;
    let mut parse_drops = 0usize;
    let mut last_sweep: Option<f64> = None;
    let mut last_time = 0.0;
    for line in reader.lines() {
        let line = line.map_err(|e| format!("read packet line: {e}"))?;
        let cleaned = line.trim();
        if cleaned.is_empty() || cleaned.starts_with('#') {
            continue;
        }
        total += 1;
        let (ts, bytes) = match parse_packet_line(cleaned) {
            Ok(parsed) => parsed,
            Err(_) => {
                parse_drops += 1;
                continue;
            }
        };
        engine.handle_packet(&bytes, ts, queue_num, ReplayVerdict);
        last_time = ts;
        match last_sweep {
            None => last_sweep = Some(ts),
            Some(t) if ts - t >= sweep_interval as f64 => {
                engine.sweep(ts);
                last_sweep = Some(ts);
            }
            _ => {}
        }
    }
    engine.sweep(last_time);

    stop.store(true, Ordering::SeqCst);
    consumer
        .join()
        .map_err(|_| "telemetry consumer panicked".to_string())?;
    let blocked = {
        let list = blocklist
            .lock()
            .map_err(|_| "block list lock poisoned".to_string())?;
        list.save(&mgr.paths.blocklist)
            .map_err(|e| format!("save block list: {e}"))?;
        list.len()
    };

    let counters = engine.counters();
    println!(
        "Run done: packets={} allowed={} denied={} parse_drops={} blocked={}",
        total, counters.allowed, counters.denied, parse_drops, blocked,
    );
    Ok(())
}

fn cmd_replay(args: Vec<String>) -> Result<(), String> {
    let mut file_path: Option<String> = None;
    let mut rules_path: Option<String> = None;
    let mut root: Option<String> = None;
    let mut identity = IdentityFlags::default();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--file" => file_path = iter.next().cloned(),
            "--rules" => rules_path = iter.next().cloned(),
            "--config-root" => root = iter.next().cloned(),
            other => {
                if !parse_identity_flag(other, &mut iter, &mut identity)? {
                    return Err(format!("Unknown flag {other}"));
                }
            }
        }
    }
    let file_path = file_path.ok_or("Missing --file <packet lines>")?;

    let mgr = manager(root)?;
    let rules_path = rules_file(&mgr, rules_path)?;
    let specs = load_rule_specs(&rules_path)?;

    let blocklist = Arc::new(Mutex::new(BlockList::new()));
    let queue = Arc::new(DynamicQueueManager::new(1024));
    let mut engine = FirewallEngine::new(Arc::clone(&blocklist), Arc::clone(&queue));
    engine
        .update(&specs, &identity.whitelist, &identity.blacklist)
        .map_err(|e| e.0)?;
    engine.set_identity_requirements(identity.synapse_names, identity.min_version);

    let file = File::open(&file_path).map_err(|e| format!("open packet file: {e}"))?;
    let reader = BufReader::new(file);
    let mut total = 0usize;
    let mut parse_drops = 0usize;
    for line in reader.lines() {
        let line = line.map_err(|e| format!("read packet line: {e}"))?;
        let cleaned = line.trim();
        if cleaned.is_empty() || cleaned.starts_with('#') {
            continue;
        }
        total += 1;
        let (ts, bytes) = match parse_packet_line(cleaned) {
            Ok(parsed) => parsed,
            Err(_) => {
                parse_drops += 1;
                continue;
            }
        };
        engine.handle_packet(&bytes, ts, 0, ReplayVerdict);
    }

    let counters = engine.counters();
    let blocked = blocklist.lock().map(|l| l.len()).unwrap_or(0);
    println!(
        "Replay done: packets={} allowed={} denied={} parse_drops={} blocked={}",
        total, counters.allowed, counters.denied, parse_drops, blocked,
    );
    Ok(())
}

fn cmd_add_rule(args: Vec<String>) -> Result<(), String> {
    let mut rule_json: Option<String> = None;
    let mut rules_path: Option<String> = None;
    let mut root: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--rule" => rule_json = iter.next().cloned(),
            "--rules" => rules_path = iter.next().cloned(),
            "--config-root" => root = iter.next().cloned(),
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let rule_json = rule_json.ok_or("Missing --rule \"<json object>\"")?;

    let mgr = manager(root)?;
    let path = rules_file(&mgr, rules_path)?;
    enforce_writable(&path)?;
    let spec: RuleSpec =
        serde_json::from_str(&rule_json).map_err(|e| format!("Invalid rule: {e}"))?;
    Rule::create(&spec).map_err(|e| e.0)?;

    let mut specs = load_rule_specs(&path)?;
    specs.push(spec);
    save_rule_specs(&path, &specs)?;
    let meta = mgr.record_version()?;
    println!(
        "Added rule {} to {} (config version {})",
        specs.len(),
        path.display(),
        meta.version
    );
    Ok(())
}

fn cmd_remove_rule(args: Vec<String>) -> Result<(), String> {
    let mut id: Option<usize> = None;
    let mut rules_path: Option<String> = None;
    let mut root: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--id" => {
                id = iter
                    .next()
                    .map(|s| s.parse::<usize>().map_err(|_| "invalid id".to_string()))
                    .transpose()?
            }
            "--rules" => rules_path = iter.next().cloned(),
            "--config-root" => root = iter.next().cloned(),
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let id = id.ok_or("Missing --id <number>")?;

    let mgr = manager(root)?;
    let path = rules_file(&mgr, rules_path)?;
    enforce_writable(&path)?;
    let mut specs = load_rule_specs(&path)?;
    if id == 0 || id > specs.len() {
        return Err("rule id out of range".into());
    }
    specs.remove(id - 1);
    save_rule_specs(&path, &specs)?;
    let meta = mgr.record_version()?;
    println!("Removed rule {} (config version {})", id, meta.version);
    Ok(())
}

fn cmd_list_rules(args: Vec<String>) -> Result<(), String> {
    let (mgr, rules_path) = common_paths(args)?;
    let path = rules_file(&mgr, rules_path)?;
    let specs = load_rule_specs(&path)?;
    for (idx, spec) in specs.iter().enumerate() {
        let line = serde_json::to_string(spec).map_err(|e| format!("encode rule: {e}"))?;
        println!("{}: {}", idx + 1, line);
    }
    Ok(())
}

fn cmd_validate_rules(args: Vec<String>) -> Result<(), String> {
    let (mgr, rules_path) = common_paths(args)?;
    let path = rules_file(&mgr, rules_path)?;
    let specs = load_rule_specs(&path)?;
    compile_rules(&specs)?;
    println!("{} rules valid", specs.len());
    Ok(())
}

fn cmd_show_blocklist(args: Vec<String>) -> Result<(), String> {
    let mut root: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config-root" => root = iter.next().cloned(),
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let mgr = manager(root)?;
    let list = BlockList::load(&mgr.paths.blocklist)
        .map_err(|e| format!("load block list: {e}"))?;
    if list.is_empty() {
        println!("Block list is empty");
        return Ok(());
    }
    for (idx, entry) in list.entries().iter().enumerate() {
        println!(
            "{}: {}:{}/{} {}",
            idx + 1,
            entry.ip,
            entry.port,
            entry.protocol,
            entry.reason
        );
    }
    Ok(())
}

fn cmd_apply_filter(args: Vec<String>) -> Result<(), String> {
    let mut rules_path: Option<String> = None;
    let mut root: Option<String> = None;
    let mut queue_num: u16 = 1;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--rules" => rules_path = iter.next().cloned(),
            "--config-root" => root = iter.next().cloned(),
            "--queue-num" => {
                queue_num = iter
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or("invalid queue number")?
            }
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let mgr = manager(root)?;
    let path = rules_file(&mgr, rules_path)?;
    let specs = load_rule_specs(&path)?;
    let rules = compile_rules(&specs)?;
    let mut filter = IptablesFilter::new();
    apply_static_rules(&mut filter, &rules, queue_num)
        .map_err(|e| format!("install kernel rules: {e}"))?;
    println!("Installed {} rules (queue {})", rules.len(), queue_num);
    Ok(())
}

fn cmd_flush_filter(args: Vec<String>) -> Result<(), String> {
    if let Some(arg) = args.first() {
        return Err(format!("Unknown flag {arg}"));
    }
    let mut filter = IptablesFilter::new();
    palisade_core::KernelFilter::flush_input_chain(&mut filter)
        .map_err(|e| format!("flush: {e}"))?;
    palisade_core::KernelFilter::create_allow_policy(&mut filter)
        .map_err(|e| format!("reset policy: {e}"))?;
    println!("Flushed INPUT chain and reset policy to accept");
    Ok(())
}

fn cmd_config_status(args: Vec<String>) -> Result<(), String> {
    let (mgr, _) = common_paths(args)?;
    let snap = mgr.snapshot();
    println!(
        "version={} hash={} tampered={}",
        snap.version, snap.hash_hex, snap.tampered
    );
    Ok(())
}

fn cmd_rollback_config(args: Vec<String>) -> Result<(), String> {
    let (mgr, _) = common_paths(args)?;
    let snap = mgr.rollback()?;
    println!("Rolled back to config version {}", snap.version);
    Ok(())
}

/// Telemetry consumer: drains the event queue, logs, appends to the events
/// file and keeps the persisted block list current.
fn spawn_consumer(
    queue: Arc<DynamicQueueManager<FirewallEvent>>,
    blocklist: Arc<Mutex<BlockList>>,
    blocklist_path: PathBuf,
    events_path: PathBuf,
    stop: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>, String> {
    let mut writer =
        EventWriter::open(&events_path).map_err(|e| format!("open events log: {e}"))?;
    Ok(thread::spawn(move || loop {
        match queue.get(Duration::from_millis(200)) {
            Some(event) => {
                log_event(&event);
                if let Err(e) = writer.append(&event) {
                    tracing::warn!("events log write failed: {e}");
                }
                if matches!(
                    event,
                    FirewallEvent::Block { .. } | FirewallEvent::Unblock { .. }
                ) {
                    if let Ok(list) = blocklist.lock() {
                        if let Err(e) = list.save(&blocklist_path) {
                            tracing::warn!("block list save failed: {e}");
                        }
                    }
                }
            }
            None => {
                // idle tick: give drained overflow queues back
                queue.cleanup();
                if stop.load(Ordering::SeqCst) && queue.is_empty() {
                    break;
                }
            }
        }
    }))
}

fn log_event(event: &FirewallEvent) {
    match event {
        FirewallEvent::Decision {
            ip,
            port,
            status,
            reason,
            ..
        } => match status {
            VerdictStatus::Deny => {
                tracing::warn!(%ip, port, reason = reason.as_deref().unwrap_or(""), "packet denied")
            }
            _ => tracing::debug!(%ip, port, "packet allowed"),
        },
        FirewallEvent::Cleanup { pruned, .. } => {
            tracing::debug!(pruned = pruned.len(), "history cleanup")
        }
        FirewallEvent::Block {
            ip, port, reason, ..
        } => tracing::info!(%ip, port, %reason, "source blocked"),
        FirewallEvent::Unblock { ip, port, .. } => {
            tracing::info!(%ip, port, "source unblocked")
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn manager(root: Option<String>) -> Result<ConfigManager, String> {
    let root = root
        .map(PathBuf::from)
        .unwrap_or_else(ConfigManager::default_root);
    ConfigManager::new(root)
}

/// Parses the trailing `--config-root`/`--rules` pair shared by read-only
/// commands.
fn common_paths(args: Vec<String>) -> Result<(ConfigManager, Option<String>), String> {
    let mut rules_path: Option<String> = None;
    let mut root: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--rules" => rules_path = iter.next().cloned(),
            "--config-root" => root = iter.next().cloned(),
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    Ok((manager(root)?, rules_path))
}

fn parse_identity_flag(
    flag: &str,
    iter: &mut std::slice::Iter<'_, String>,
    identity: &mut IdentityFlags,
) -> Result<bool, String> {
    match flag {
        "--synapse-names" => {
            identity.synapse_names = iter.next().map(|v| parse_list(v)).unwrap_or_default();
        }
        "--min-version" => {
            identity.min_version = Some(
                iter.next()
                    .and_then(|v| v.parse().ok())
                    .ok_or("invalid minimum version")?,
            );
        }
        "--whitelist" => {
            identity.whitelist = iter.next().map(|v| parse_list(v)).unwrap_or_default();
        }
        "--blacklist" => {
            identity.blacklist = iter.next().map(|v| parse_list(v)).unwrap_or_default();
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn rules_file(mgr: &ConfigManager, path: Option<String>) -> Result<PathBuf, String> {
    match path {
        Some(p) => mgr.resolve_path(&p),
        None => Ok(mgr.paths.rules.clone()),
    }
}

fn load_rule_specs(path: &Path) -> Result<Vec<RuleSpec>, String> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).map_err(|e| format!("read rules: {e}"))?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&text).map_err(|e| format!("parse rules: {e}"))
}

fn save_rule_specs(path: &Path, specs: &[RuleSpec]) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("create rules dir: {e}"))?;
    }
    let body = serde_json::to_string_pretty(specs).map_err(|e| format!("encode rules: {e}"))?;
    fs::write(path, body).map_err(|e| format!("write rules: {e}"))
}

fn compile_rules(specs: &[RuleSpec]) -> Result<Vec<Rule>, String> {
    let mut rules = Vec::with_capacity(specs.len());
    for (idx, spec) in specs.iter().enumerate() {
        let rule = Rule::create(spec).map_err(|e| format!("rule {}: {}", idx + 1, e.0))?;
        rules.push(rule);
    }
    Ok(rules)
}

fn enforce_writable(path: &Path) -> Result<(), String> {
    if std::env::var("PALISADE_CONFIG_READONLY").as_deref() == Ok("1") {
        return Err(format!(
            "config is read-only (PALISADE_CONFIG_READONLY=1): {}",
            path.display()
        ));
    }
    Ok(())
}

/// One captured packet per line: `<unix seconds> <hex bytes>`.
fn parse_packet_line(line: &str) -> Result<(f64, Vec<u8>), String> {
    let mut fields = line.split_whitespace();
    let ts = fields
        .next()
        .and_then(|t| t.parse::<f64>().ok())
        .ok_or("missing timestamp")?;
    let hex = fields.next().ok_or("missing packet bytes")?;
    if fields.next().is_some() {
        return Err("trailing fields".into());
    }
    let bytes = hex_to_bytes(hex)?;
    Ok((ts, bytes))
}

fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, String> {
    let cleaned: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() % 2 != 0 {
        return Err("hex input must have an even number of digits".into());
    }
    let mut bytes = Vec::with_capacity(cleaned.len() / 2);
    for chunk in cleaned.as_bytes().chunks(2) {
        let pair = std::str::from_utf8(chunk).map_err(|_| "invalid hex".to_string())?;
        let byte = u8::from_str_radix(pair, 16).map_err(|_| "invalid hex".to_string())?;
        bytes.push(byte);
    }
    Ok(bytes)
}

fn print_usage_and_exit() {
    eprintln!("Usage:");
    eprintln!("  palisade run --file <packets|-> [--rules rules.json] [--queue-num 1]");
    eprintln!("               [--apply-filter] [--sweep-interval 60]");
    eprintln!("  palisade replay --file <packets> [--rules rules.json]");
    eprintln!("  palisade add-rule --rule '{{\"type\": \"allow\", \"ip\": \"10.0.0.2\"}}'");
    eprintln!("  palisade remove-rule --id 1");
    eprintln!("  palisade list-rules");
    eprintln!("  palisade validate-rules");
    eprintln!("  palisade show-blocklist");
    eprintln!("  palisade apply-filter [--queue-num 1]");
    eprintln!("  palisade flush-filter");
    eprintln!("  palisade config-status");
    eprintln!("  palisade rollback-config");
    eprintln!("  palisade show-config-root");
    eprintln!();
    eprintln!("Identity flags for run/replay:");
    eprintln!("  --synapse-names Foo,Score --min-version 225");
    eprintln!("  --whitelist <keys> --blacklist <keys>");
    std::process::exit(1);
}
