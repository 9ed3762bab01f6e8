use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ldapmux::ber::BerWriter;
use ldapmux::config::{BindConfig, TlsConfig};
use ldapmux::ldap_protocol::{AttributeValue, SearchResultEntry, SearchScope};
use ldapmux::{ClientConfig, Filter, LdapClient};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ldapmux")]
#[command(about = "LDAP v3 client - runs operations over one multiplexed connection")]
struct Args {
    /// Client configuration file (YAML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Server URL (overrides config; e.g. ldaps://ldap.example.com)
    #[arg(short = 'H', long, value_name = "URL", global = true)]
    url: Option<String>,

    /// Simple bind DN (overrides config)
    #[arg(short = 'D', long, value_name = "DN", global = true)]
    bind_dn: Option<String>,

    /// Simple bind password
    #[arg(short = 'w', long, value_name = "PASSWORD", global = true)]
    password: Option<String>,

    /// Upgrade the connection with StartTLS before binding
    #[arg(long, global = true)]
    starttls: bool,

    /// Print client metrics (Prometheus text) after the command
    #[arg(long, global = true)]
    metrics: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search and print entries as LDIF
    Search {
        #[arg(short, long)]
        base: String,
        #[arg(short, long, value_enum, default_value = "sub")]
        scope: Scope,
        #[arg(short, long, default_value = "(objectClass=*)")]
        filter: String,
        /// Fetch results in pages of this size
        #[arg(long)]
        page_size: Option<i32>,
        /// Attributes to return (all user attributes if empty)
        attributes: Vec<String>,
    },
    /// Compare an attribute value, prints TRUE or FALSE
    Compare {
        dn: String,
        attribute: String,
        value: String,
    },
    /// Delete an entry
    Delete { dn: String },
    /// Print the authorization identity of the connection
    Whoami,
    /// Parse a filter and print its normalized form and BER encoding
    Filter { filter: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Scope {
    Base,
    One,
    Sub,
}

impl From<Scope> for SearchScope {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Base => SearchScope::BaseObject,
            Scope::One => SearchScope::SingleLevel,
            Scope::Sub => SearchScope::WholeSubtree,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldapmux={},info", log_level))
        .with_writer(std::io::stderr)
        .init();

    // Offline: no connection needed
    if let Command::Filter { filter } = &args.command {
        return print_filter(filter);
    }

    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(url) = args.url {
        config.url = url;
    }
    if let Some(dn) = args.bind_dn {
        config.bind = Some(BindConfig {
            dn,
            password: args.password.unwrap_or_default(),
        });
    }
    if args.starttls {
        config.tls.get_or_insert_with(TlsConfig::default).starttls = true;
    }

    info!("Connecting to {}", config.url);
    let client = LdapClient::connect(&config)
        .await
        .with_context(|| format!("Connect to {}", config.url))?;

    let outcome = run(&client, args.command, config.page_size).await;

    if args.metrics {
        print!("{}", client.metrics().render());
    }
    if let Err(e) = client.unbind().await {
        warn!("Unbind failed: {}", e);
    }
    outcome
}

async fn run(client: &LdapClient, command: Command, default_page_size: i32) -> Result<()> {
    match command {
        Command::Search {
            base,
            scope,
            filter,
            page_size,
            attributes,
        } => {
            let attrs: Vec<&str> = attributes.iter().map(String::as_str).collect();
            if page_size.is_some() {
                let mut pages = client.search_paged(&base, scope.into(), &filter, &attrs, page_size)?;
                while let Some(page) = pages.next_page().await? {
                    for entry in &page {
                        print_entry(entry);
                    }
                }
                info!("{} entries (page size {})", pages.fetched(), page_size.unwrap_or(default_page_size));
            } else {
                let result = client.search(&base, scope.into(), &filter, &attrs).await?;
                for entry in &result.entries {
                    print_entry(entry);
                }
                for uris in &result.referrals {
                    for uri in uris {
                        println!("ref: {}", uri);
                    }
                }
                info!("{} entries", result.entries.len());
            }
        }
        Command::Compare { dn, attribute, value } => {
            let matched = client.compare(&dn, &attribute, value.as_bytes()).await?;
            println!("{}", if matched { "TRUE" } else { "FALSE" });
        }
        Command::Delete { dn } => {
            client.delete(&dn).await?;
            println!("deleted: {}", dn);
        }
        Command::Whoami => {
            let id = client.who_am_i().await?;
            println!("{}", if id.is_empty() { "anonymous" } else { id.as_str() });
        }
        Command::Filter { filter } => print_filter(&filter)?,
    }
    Ok(())
}

fn print_filter(text: &str) -> Result<()> {
    let filter: Filter = text.parse().context("Invalid filter")?;
    let mut w = BerWriter::new();
    filter.write_ber(&mut w);
    let bytes = w.into_bytes().context("Encode filter")?;
    let hex: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    println!("{}", filter);
    println!("{}", hex.join(" "));
    Ok(())
}

fn print_entry(entry: &SearchResultEntry) {
    println!("dn: {}", entry.object_name);
    for attr in &entry.attributes {
        for value in &attr.attr_values {
            match value {
                AttributeValue::Text(text) => println!("{}: {}", attr.attr_type, text),
                AttributeValue::Binary(bytes) => {
                    println!("{}: <{} bytes binary>", attr.attr_type, bytes.len())
                }
            }
        }
    }
    println!();
}
