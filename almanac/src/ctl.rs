//! almanacctl - Almanac control utility

use almanac::client::SettingsClient;
use almanac_core::{infer_type, ResponseData, SettingsRequest, Value};
use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;

/// Almanac control utility
#[derive(Parser)]
#[command(name = "almanacctl", version, about = "Control the Almanac settings daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Socket path
    #[arg(long, default_value = "/run/almanac/almanac.sock")]
    socket: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a setting, or every setting under a group
    Get {
        /// Setting or group path
        path: String,
    },

    /// Show a setting in text form
    Text {
        /// Setting or group path
        path: String,
    },

    /// Change a setting
    Set {
        /// Setting path
        path: String,
        /// New value (JSON number or string)
        value: String,
    },

    /// Show the attributes of a setting
    Info {
        /// Setting path
        path: String,
    },

    /// Create or redefine a setting
    Add {
        /// Setting path
        path: String,
        /// Default value (JSON number or string)
        default: String,
        /// Type code (i, f or s); inferred from the default when omitted
        #[arg(short, long)]
        r#type: Option<String>,
        /// Minimum
        #[arg(long)]
        min: Option<String>,
        /// Maximum
        #[arg(long)]
        max: Option<String>,
        /// Do not log value changes
        #[arg(long)]
        silent: bool,
    },

    /// Remove settings
    Remove {
        /// Setting paths
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Reset a setting, or every setting under a group, to its default
    Default {
        /// Setting or group path
        path: String,
    },

    /// Print every setting
    Dump,

    /// Stream change events
    Watch {
        /// Only events under this path
        prefix: Option<String>,
    },

    /// Show daemon status
    Status,

    /// Write pending changes to disk now
    Flush,
}

/// Parse a command line value as JSON, falling back to a plain string
fn parse_json(raw: &str) -> JsonValue {
    serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string()))
}

fn split_setting_path(path: &str) -> (String, String) {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some((group, name)) if !group.is_empty() => (group.to_string(), name.to_string()),
        Some((_, name)) => ("/".to_string(), name.to_string()),
        None => ("/Settings".to_string(), path.to_string()),
    }
}

fn print_data(data: ResponseData) {
    match data {
        ResponseData::Value(value) => println!("{}", value),
        ResponseData::Text(text) => println!("{}", text),
        ResponseData::Values(values) => {
            for (path, value) in values {
                println!("{} = {}", path, value);
            }
        }
        ResponseData::Texts(texts) => {
            for (path, text) in texts {
                println!("{} = {}", path, text);
            }
        }
        other => match serde_json::to_string_pretty(&other) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{:?}", other),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = SettingsClient::new(&cli.socket);

    match cli.command {
        Commands::Get { path } => match client.request(SettingsRequest::GetValue { path }).await {
            Ok(data) => print_data(data),
            Err(e) => eprintln!("Error: {}", e),
        },

        Commands::Text { path } => match client.request(SettingsRequest::GetText { path }).await {
            Ok(data) => print_data(data),
            Err(e) => eprintln!("Error: {}", e),
        },

        Commands::Set { path, value } => {
            let Some(value) = Value::from_json(&parse_json(&value)) else {
                eprintln!("Error: value must be a number or a string");
                return Ok(());
            };
            match client.set_value(&path, value).await {
                Ok(true) => println!("{} updated", path),
                Ok(false) => eprintln!("Error: value rejected for {}", path),
                Err(e) => eprintln!("Error: {}", e),
            }
        }

        Commands::Info { path } => {
            match client.request(SettingsRequest::GetAttributes { path }).await {
                Ok(ResponseData::Attributes(attributes)) => {
                    let show = |v: &Option<Value>| v.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
                    println!("Type:    {}", attributes.value_type.code());
                    println!("Default: {}", show(&attributes.default));
                    println!("Min:     {}", show(&attributes.min));
                    println!("Max:     {}", show(&attributes.max));
                    println!("Silent:  {}", if attributes.silent { "yes" } else { "no" });
                }
                Ok(other) => print_data(other),
                Err(e) => eprintln!("Error: {}", e),
            }
        }

        Commands::Add {
            path,
            default,
            r#type,
            min,
            max,
            silent,
        } => {
            let default = parse_json(&default);
            let Some(item_type) = r#type.or_else(|| infer_type(&default).map(str::to_string)) else {
                eprintln!("Error: cannot infer the type of {}", default);
                return Ok(());
            };
            let (group, name) = split_setting_path(&path);
            let request = if silent {
                SettingsRequest::AddSilentSetting {
                    group,
                    name,
                    default,
                    item_type,
                    min: min.as_deref().map(parse_json),
                    max: max.as_deref().map(parse_json),
                }
            } else {
                SettingsRequest::AddSetting {
                    group,
                    name,
                    default,
                    item_type,
                    min: min.as_deref().map(parse_json),
                    max: max.as_deref().map(parse_json),
                }
            };
            match client.request(request).await {
                Ok(ResponseData::Value(value)) => println!("{} = {}", path, value),
                Ok(other) => print_data(other),
                Err(e) => eprintln!("Error: {}", e),
            }
        }

        Commands::Remove { paths } => {
            let request = SettingsRequest::RemoveSettings {
                group: "/".to_string(),
                paths: paths.clone(),
            };
            match client.request(request).await {
                Ok(ResponseData::RemoveStatuses(statuses)) => {
                    for (path, status) in paths.iter().zip(statuses) {
                        if status == 0 {
                            println!("{} removed", path);
                        } else {
                            eprintln!("{} not found", path);
                        }
                    }
                }
                Ok(other) => print_data(other),
                Err(e) => eprintln!("Error: {}", e),
            }
        }

        Commands::Default { path } => {
            match client.request(SettingsRequest::SetDefault { path: path.clone() }).await {
                Ok(ResponseData::WriteStatus(0)) => println!("{} reset", path),
                Ok(ResponseData::WriteStatus(_)) => eprintln!("Error: {} cannot be reset", path),
                Ok(ResponseData::Count(count)) => println!("{} settings reset", count),
                Ok(other) => print_data(other),
                Err(e) => eprintln!("Error: {}", e),
            }
        }

        Commands::Dump => match client.get_values("/").await {
            Ok(values) => {
                for (path, value) in values {
                    println!("/{} = {}", path, value);
                }
            }
            Err(e) => eprintln!("Error: {}", e),
        },

        Commands::Watch { prefix } => {
            let mut events = client.subscribe(prefix).await?;
            while let Some(event) = events.next_event().await? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }

        Commands::Status => {
            let status = client.get_status().await?;

            println!("Almanac Status");
            println!("==============");
            println!("Schema:    {}", status.schema_version);
            println!("Settings:  {}", status.setting_count);
            println!("Data file: {}", status.data_file);
            println!("Pending:   {}", if status.save_pending { "yes" } else { "no" });
        }

        Commands::Flush => match client.request(SettingsRequest::Flush).await {
            Ok(ResponseData::Flushed { saved: true }) => println!("Settings saved"),
            Ok(ResponseData::Flushed { saved: false }) => println!("Nothing to save"),
            Ok(other) => print_data(other),
            Err(e) => eprintln!("Error: {}", e),
        },
    }

    Ok(())
}
