use evidence_core::audit::log::AuditLog;
use evidence_core::error::CoreResult;
use evidence_core::evidence::store::audit_path;
use evidence_core::evidence::EvidenceStore;
use evidence_core::records::now_ms;
use evidence_core::session::{CancelToken, Session};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: evidence_admin <stats|dedup|verify|export|orphans|expiring|purge> <store_root> <org_id> [actor_id]
       evidence_admin audit-verify <store_root>";

// Maintenance passes stop between batches once this budget is spent.
const PASS_TIMEOUT: Duration = Duration::from_secs(300);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    }
    let root = Path::new(&args[2]);

    if args[1] == "audit-verify" {
        match AuditLog::verify(audit_path(root)) {
            Ok(v) => {
                print_json(&v);
                std::process::exit(if v.intact { 0 } else { 1 });
            }
            Err(e) => fail(e),
        }
    }

    if args.len() < 4 {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    }
    let actor = args.get(4).map(String::as_str).unwrap_or("evidence_admin");
    let session = match Session::for_scope(&args[3], actor) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };
    let store = match EvidenceStore::open(root) {
        Ok(s) => s,
        Err(e) => fail(e),
    };

    let code = match run(&args[1], &store, &session) {
        Ok(code) => code,
        Err(e) => fail(e),
    };
    std::process::exit(code);
}

fn run(command: &str, store: &EvidenceStore, session: &Session) -> CoreResult<i32> {
    let cancel = CancelToken::with_timeout(PASS_TIMEOUT);
    match command {
        "stats" => print_json(&store.get_stats(session)?),
        "dedup" => {
            let report = store.remove_duplicates(session, &cancel)?;
            print_json(&report);
            if report.batches_failed > 0 || report.cancelled {
                return Ok(1);
            }
        }
        "verify" => {
            let report = store.verify_all(session)?;
            print_json(&report);
            if !report.all_match() {
                return Ok(1);
            }
        }
        "export" => print!("{}", store.export_register_csv(session)?),
        "orphans" => print_json(&store.find_orphaned_objects(session)?),
        "expiring" => print_json(&store.expiring_soon(session, now_ms())?),
        "purge" => {
            let report = store.purge_expired(session, now_ms(), &cancel)?;
            print_json(&report);
            if report.batches_failed > 0 || report.cancelled {
                return Ok(1);
            }
        }
        other => {
            eprintln!("unknown command: {}\n{}", other, USAGE);
            return Ok(2);
        }
    }
    Ok(0)
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => fail(e.into()),
    }
}

fn fail(e: evidence_core::error::CoreError) -> ! {
    eprintln!("evidence_admin error ({:?}): {}", e.kind(), e);
    std::process::exit(1);
}
