//! Local CA - interactive registry of private Certificate Authorities
//!
//! Reads one command per line from stdin:
//!
//! - `create`: bootstrap a new root CA (prompts for domain, folder, subject and passphrase)
//! - `list`: show every CA found under the registry root
//! - `select`: choose the CA that `add` and `show` work on
//! - `add`: issue a server certificate from the selected CA
//! - `show`: print the selected CA and the servers already issued
//! - `help`, `quit`/`exit`
//!
//! Failed commands are reported and the loop keeps going. End of input exits.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use local_ca::configs::AppConfig;
use local_ca::crypto_engine::CryptoEngine;
use local_ca::identity_template::SubjectFields;
use local_ca::issuance::{default_storage_dir, BootstrapRequest, CreateOutcome, IssuanceSettings};
use local_ca::passphrase::Passphrase;
use local_ca::record_store::DirectoryStore;
use local_ca::session::{RegistrySession, SessionState};

type Session = RegistrySession<DirectoryStore, Box<dyn CryptoEngine>>;

#[derive(Debug, Parser)]
#[command(name = "local-ca", version, about = "Local registry of private Certificate Authorities")]
struct Args {
    /// Configuration file (defaults to ./config.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Registry root directory, overrides `registry.root`
    #[arg(long)]
    root: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))
        .context("Invalid logging filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let root = args.root.unwrap_or_else(|| config.registry.root.clone());
    tracing::debug!(root = %root.display(), backend = ?config.engine.backend, "starting");

    let mut session = RegistrySession::new(
        DirectoryStore::new(&root),
        config.engine.build(),
        IssuanceSettings::from(&config.issuance),
    );

    println!("=== Local CA ===");
    println!("Registry root: {}", root.display());
    println!("Type 'help' for the list of commands.");

    loop {
        let prompt = match session.state() {
            SessionState::Selected(ca) => format!("\n[{}]> ", ca.domain),
            SessionState::NoSelection => "\n> ".to_string(),
        };
        let Some(line) = read_line(&prompt)? else {
            println!();
            break;
        };

        let outcome = match line.as_str() {
            "" => Ok(()),
            "create" => create_authority(&mut session),
            "list" => list_authorities(&mut session),
            "select" => select_authority(&mut session),
            "add" => add_server(&mut session),
            "show" => show_selection(&session),
            "help" => {
                print_help();
                Ok(())
            }
            "quit" | "exit" => break,
            other => {
                println!("Unknown command '{}'. Type 'help' for the list of commands.", other);
                Ok(())
            }
        };

        if let Err(e) = outcome {
            println!("✗ {:#}", e);
        }
    }

    println!("Exiting Local CA...");
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  create   Create a new root certificate authority");
    println!("  list     List known certificate authorities");
    println!("  select   Select the certificate authority to issue from");
    println!("  add      Issue a server certificate from the selected CA");
    println!("  show     Show the selected CA and its issued servers");
    println!("  help     Show this help");
    println!("  quit     Exit (also 'exit')");
}

/// Print `prompt` and read one trimmed line; `None` on end of input
fn read_line(prompt: &str) -> Result<Option<String>> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    if io::stdin().read_line(&mut input)? == 0 {
        return Ok(None);
    }
    Ok(Some(input.trim().to_string()))
}

fn ask(prompt: &str) -> Result<String> {
    read_line(prompt)?.context("Unexpected end of input")
}

fn ask_with_default(prompt: &str, default: &str) -> Result<String> {
    let answer = ask(&format!("{} [{}]: ", prompt, default))?;
    Ok(if answer.is_empty() {
        default.to_string()
    } else {
        answer
    })
}

fn confirm(prompt: &str) -> bool {
    matches!(
        read_line(&format!("{} [y/N]: ", prompt)),
        Ok(Some(answer)) if answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes")
    )
}

fn ask_new_passphrase() -> Result<Passphrase> {
    let passphrase = Passphrase::prompt("Root key passphrase: ").context("Failed to read passphrase")?;
    let verify = Passphrase::prompt("Verify passphrase: ").context("Failed to read passphrase")?;
    anyhow::ensure!(passphrase.matches(&verify), "Passphrases do not match");
    Ok(passphrase)
}

fn create_authority(session: &mut Session) -> Result<()> {
    println!("\n=== Create Certificate Authority ===");
    let domain = ask("Domain (e.g. example.com): ")?;
    let storage_dir = ask_with_default("Target folder", &default_storage_dir(&domain))?;

    let subject = SubjectFields::builder()
        .common_name(ask("Common name: ")?)
        .state(ask("State or province: ")?)
        .country(ask("Country (2-letter code): ")?)
        .email(ask("Email: ")?)
        .organization(ask("Organization: ")?)
        .organizational_unit(ask("Organizational unit: ")?)
        .build()?;
    let passphrase = ask_new_passphrase()?;

    let request = BootstrapRequest {
        domain,
        storage_dir: Some(storage_dir),
        subject,
        passphrase,
    };
    let outcome = session.create(&request, |path: &Path| {
        confirm(&format!("{} already exists. Overwrite it?", path.display()))
    })?;

    match outcome {
        CreateOutcome::Created(ca) => {
            println!("✓ Root CA for {} created in {}", ca.domain, ca.storage_path.display());
            println!("  certificate: {}", ca.root_certificate_path().display());
        }
        CreateOutcome::Declined { path } => {
            println!("Left {} untouched.", path.display());
        }
    }
    Ok(())
}

fn list_authorities(session: &mut Session) -> Result<()> {
    print_authorities(session)?;
    Ok(())
}

/// Print the current listing numbered from 1; returns how many were shown
fn print_authorities(session: &mut Session) -> Result<usize> {
    let authorities = session.list()?;
    if authorities.is_empty() {
        println!("No certificate authorities found. Use 'create' to add one.");
    }
    for (i, ca) in authorities.iter().enumerate() {
        println!("{:>3}. {:<30} {}", i + 1, ca.domain, ca.storage_path.display());
    }
    Ok(authorities.len())
}

fn select_authority(session: &mut Session) -> Result<()> {
    if print_authorities(session)? == 0 {
        return Ok(());
    }

    let answer = ask("\nSelect a CA (0 to cancel): ")?;
    let choice: usize = answer
        .parse()
        .with_context(|| format!("'{}' is not a number", answer))?;
    if choice == 0 {
        return Ok(());
    }

    let ca = session.select(choice - 1)?;
    println!("✓ Selected {}", ca.domain);
    Ok(())
}

fn add_server(session: &mut Session) -> Result<()> {
    let domain = session.selected()?.domain.clone();
    println!("\n=== Issue Server Certificate ({}) ===", domain);

    let server_name = ask("Server name (e.g. www): ")?;
    let server_ip = ask("Server IP: ")?;
    let passphrase = Passphrase::prompt("Root key passphrase: ").context("Failed to read passphrase")?;

    let issued = session.add(&server_name, &server_ip, &passphrase)?;
    println!("✓ Issued {}.{}", issued.server_name, issued.authority_domain);
    println!("  key:         {}", issued.files.key_file.display());
    println!("  request:     {}", issued.files.csr_file.display());
    println!("  certificate: {}", issued.files.certificate_file.display());
    println!("  bundle:      {}", issued.files.bundle_file.display());
    Ok(())
}

fn show_selection(session: &Session) -> Result<()> {
    let summary = session.show_selection()?;
    let ca = &summary.authority;
    println!("Domain:       {}", ca.domain);
    println!("Directory:    {}", ca.storage_path.display());
    println!("Common name:  {}", ca.subject.common_name);
    println!("Organization: {} / {}", ca.subject.organization, ca.subject.organizational_unit);
    println!("Location:     {}, {}", ca.subject.state, ca.subject.country);
    println!("Email:        {}", ca.subject.email);
    if summary.issued_servers.is_empty() {
        println!("Servers:      (none)");
    } else {
        println!("Servers:      {}", summary.issued_servers.join(", "));
    }
    Ok(())
}
