//! Command-line front end for comscope.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "comscope")]
#[command(about = "Inspect the COM broker runtime state of live processes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse every process on the system and summarize broker state
    Scan {
        /// Emit full snapshots as JSON instead of a summary table
        #[arg(long)]
        json: bool,
    },
    /// Inspect one process in detail
    Inspect {
        /// Process ID to target
        #[arg(short, long, group = "target")]
        pid: Option<u32>,
        /// Process name to target (e.g., "notepad.exe" or "notepad")
        #[arg(short, long, group = "target")]
        name: Option<String>,
        /// Emit the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Emit the marshaled object reference for one live registration
    Objref {
        /// Process ID to target
        #[arg(short, long, group = "target")]
        pid: Option<u32>,
        /// Process name to target
        #[arg(short, long, group = "target")]
        name: Option<String>,
        /// Interface pointer identifier of the registration
        #[arg(short, long)]
        ipid: String,
    },
}

#[cfg(not(windows))]
fn main() {
    let _ = Cli::parse();
    eprintln!("comscope inspects the Windows COM broker and only runs on Windows targets");
    std::process::exit(1);
}

#[cfg(windows)]
fn main() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = app::run(cli.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(windows)]
mod app {
    use comscope_core::{
        enable_debug_privilege, find_process_by_name, scan_processes, AnalysisSession, Error,
        IpidEntry, ProcessSnapshot, Result,
    };

    use crate::Commands;

    pub fn run(command: Commands) -> Result<()> {
        match command {
            Commands::Scan { json } => scan(json),
            Commands::Inspect { pid, name, json } => {
                inspect(resolve_target(pid, name)?, json)
            }
            Commands::Objref { pid, name, ipid } => {
                objref(resolve_target(pid, name)?, &ipid)
            }
        }
    }

    fn resolve_target(pid: Option<u32>, name: Option<String>) -> Result<u32> {
        match (pid, name) {
            (Some(pid), _) => Ok(pid),
            (None, Some(name)) => find_process_by_name(&name),
            (None, None) => Err(Error::Other(
                "specify a target with --pid or --name".to_string(),
            )),
        }
    }

    fn scan(json: bool) -> Result<()> {
        let session = AnalysisSession::new();
        let snapshots = scan_processes(
            &session,
            Some(&mut |pid, index, total| {
                eprint!("\rParsing process {pid} ({}/{total})    ", index + 1);
            }),
        );
        eprintln!();

        if json {
            println!("{}", serde_json::to_string_pretty(&snapshots).map_err(to_error)?);
            return Ok(());
        }

        println!(
            "\n=== Processes with broker state ({}) ===\n",
            snapshots.len()
        );
        for snapshot in &snapshots {
            println!(
                "  {:>6}  {:<24} {:>2}-bit  {:>4} IPIDs  user={}",
                snapshot.pid,
                snapshot.name(),
                snapshot.pointer_width.bits(),
                snapshot.ipids.len(),
                snapshot.user,
            );
        }
        Ok(())
    }

    fn inspect(pid: u32, json: bool) -> Result<()> {
        let snapshot = parse_one(pid)?;

        if json {
            println!("{}", serde_json::to_string_pretty(&snapshot).map_err(to_error)?);
            return Ok(());
        }

        println!("\n=== {} (pid {}) ===\n", snapshot.name(), snapshot.pid);
        println!("  Path:           {}", snapshot.executable_path);
        println!("  Architecture:   {}-bit", snapshot.pointer_width.bits());
        println!("  User:           {} ({})", snapshot.user, snapshot.user_sid);
        println!("  AppId:          {}", snapshot.app_id);
        println!("  RPC endpoint:   {}", snapshot.rpc_endpoint);
        println!("  Authn level:    {:?}", snapshot.authn_level);
        println!("  Imp level:      {:?}", snapshot.imp_level);
        println!("  Capabilities:   {:?}", snapshot.capabilities);
        println!("  Access perms:   {}", snapshot.access_permissions);
        println!("  LRPC perms:     {}", snapshot.lrpc_permissions);
        println!("  Access control: 0x{:X}", snapshot.access_control);
        println!("  STA main hwnd:  0x{:X}", snapshot.sta_main_hwnd);

        println!("\n  IPID entries ({}):", snapshot.ipids.len());
        for entry in &snapshot.ipids {
            print_entry(entry);
        }
        Ok(())
    }

    fn print_entry(entry: &IpidEntry) {
        println!("\n    IPID {}  apartment {}", entry.ipid, entry.apartment_id());
        println!("      IID:     {}", entry.iid);
        println!("      OXID:    {}", entry.oxid);
        println!(
            "      Refs:    strong={} weak={} private={}",
            entry.strong_refs, entry.weak_refs, entry.private_refs
        );
        println!(
            "      Flags:   {:?} (running={})",
            entry.flags,
            entry.is_running()
        );
        if let Some(vtable) = &entry.interface_vtable {
            println!("      VTable:  {} @ 0x{:X}", vtable, entry.interface_ptr);
        }
        if let Some(vtable) = &entry.stub_vtable {
            println!("      Stub:    {} @ 0x{:X}", vtable, entry.stub_ptr);
        }
    }

    fn objref(pid: u32, ipid: &str) -> Result<()> {
        let wanted: uuid::Uuid = ipid
            .trim_matches(&['{', '}'][..])
            .parse()
            .map_err(|_| Error::Other(format!("'{ipid}' is not a valid IPID")))?;

        let snapshot = parse_one(pid)?;
        let entry = snapshot
            .ipids
            .iter()
            .find(|entry| entry.ipid == wanted)
            .ok_or_else(|| Error::Other(format!("no live entry with IPID {wanted}")))?;

        let blob = entry.to_objref()?;
        let hex: String = blob.iter().map(|b| format!("{b:02x}")).collect();
        println!("{hex}");
        Ok(())
    }

    fn parse_one(pid: u32) -> Result<ProcessSnapshot> {
        if let Err(e) = enable_debug_privilege() {
            eprintln!("Warning: debug privilege unavailable: {e}");
        }
        let session = AnalysisSession::new();
        ProcessSnapshot::parse(&session, pid).ok_or_else(|| {
            Error::Other(format!(
                "process {pid} could not be parsed (not running, access denied, or architecture mismatch)"
            ))
        })
    }

    fn to_error(e: serde_json::Error) -> Error {
        Error::Other(e.to_string())
    }
}
