use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use asa_core::archive::Archive;
use asa_core::context::Name;
use asa_core::property::{EnumValue, Property, PropertyType};
use asa_core::{DecodeOptions, DecodePolicy, Patcher, SaveError, SaveStore, Value};
use clap::{Parser, Subcommand};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(value_name = "SAVE.ark")]
    path: PathBuf,
    /// Skip objects that fail to decode instead of stopping.
    #[arg(long = "allow-invalid", global = true)]
    allow_invalid: bool,
    /// Treat struct size mismatches as errors.
    #[arg(long, global = true)]
    strict: bool,
    /// JSON file with decode options; flags are applied on top.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Save version, game time and table sizes.
    Summary,
    /// List objects, optionally filtered by blueprint.
    Objects {
        /// Only blueprints containing this text.
        #[arg(long)]
        blueprint: Option<String>,
    },
    /// Print every property of one object.
    Dump { id: Uuid },
    /// Change one property value in place and save.
    Patch {
        id: Uuid,
        #[arg(long)]
        property: String,
        /// Which tag to edit when the name occurs more than once.
        #[arg(long, default_value_t = 0)]
        occurrence: usize,
        #[arg(long, allow_hyphen_values = true)]
        value: String,
        /// Write the patched save here instead of over the input.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Decode the archives frozen inside an item.
    Cryopod { id: Uuid },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let options = decode_options(&cli).unwrap_or_else(|e| {
        eprintln!("Error reading config: {e}");
        process::exit(2);
    });
    let policy = DecodePolicy::new(options).with_hook(Arc::new(|id: &Uuid, error: &SaveError| {
        warn!(%id, code = ?error.code(), "invalid object");
    }));
    let mut store = SaveStore::open_with(&cli.path, policy).unwrap_or_else(|e| {
        eprintln!("Error opening save file: {}", cli.path.display());
        eprintln!("  {e}");
        process::exit(1);
    });

    let result = match &cli.command {
        Command::Summary => summary(&mut store, cli.json),
        Command::Objects { blueprint } => objects(&mut store, blueprint.as_deref(), cli.json),
        Command::Dump { id } => dump(&mut store, id, cli.json),
        Command::Patch {
            id,
            property,
            occurrence,
            value,
            output,
        } => patch(
            &mut store,
            id,
            property,
            *occurrence,
            value,
            output.as_deref(),
        ),
        Command::Cryopod { id } => cryopod(&mut store, id, options, cli.json),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn decode_options(cli: &Cli) -> Result<DecodeOptions, String> {
    let mut options: DecodeOptions = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
            serde_json::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))?
        }
        None => DecodeOptions::default(),
    };
    options.allow_invalid_objects |= cli.allow_invalid;
    options.strict_struct_sizes |= cli.strict;
    options.verbose_recovery |= cli.verbose;
    Ok(options)
}

fn print_json(value: &JsonValue) -> asa_core::Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| SaveError::invalid(format!("rendering JSON output: {e}")))?;
    println!("{rendered}");
    Ok(())
}

fn to_json(value: &impl serde::Serialize) -> asa_core::Result<JsonValue> {
    serde_json::to_value(value).map_err(|e| SaveError::invalid(format!("rendering JSON output: {e}")))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn summary(store: &mut SaveStore, json: bool) -> asa_core::Result<()> {
    let stats = store.stats()?;
    if json {
        return print_json(&to_json(&stats)?);
    }

    println!("Version:     {}", stats.version);
    if let Some(game_time) = stats.game_time {
        println!("Game time:   {}", format_game_time(game_time));
    }
    println!("Objects:     {}", stats.objects);
    println!("Names:       {}", stats.names);
    println!("Transforms:  {}", stats.transforms);
    println!("Custom keys: {}", stats.custom_keys.join(", "));
    Ok(())
}

fn objects(store: &mut SaveStore, blueprint: Option<&str>, json: bool) -> asa_core::Result<()> {
    let report = store.scan(|name| blueprint.is_none_or(|b| name.contains(b)), |_| true)?;
    let mut objects = report.objects;
    objects.sort_by(|a, b| a.blueprint.base().cmp(b.blueprint.base()).then(a.id.cmp(&b.id)));

    if json {
        let rows: Vec<JsonValue> = objects
            .iter()
            .map(|object| {
                json!({
                    "id": object.id.to_string(),
                    "blueprint": object.blueprint.to_string(),
                    "properties": object.properties.len(),
                })
            })
            .collect();
        return print_json(&json!({ "objects": rows, "skipped": report.skipped }));
    }

    for object in &objects {
        println!(
            "{}  {}  ({} properties)",
            object.id,
            object.blueprint,
            object.properties.len()
        );
    }
    if report.skipped > 0 {
        println!("{} object(s) skipped", report.skipped);
    }
    Ok(())
}

fn dump(store: &mut SaveStore, id: &Uuid, json: bool) -> asa_core::Result<()> {
    let object = store.get_object(id)?;
    if json {
        let mut out = JsonMap::new();
        out.insert("object".to_string(), to_json(&*object)?);
        if let Some(transform) = store.context()?.transform(id) {
            out.insert("transform".to_string(), to_json(transform)?);
        }
        return print_json(&JsonValue::Object(out));
    }

    println!("{}  {}", object.id, object.blueprint);
    if let Some(transform) = store.context()?.transform(id) {
        println!(
            "  at ({:.1}, {:.1}, {:.1}) yaw {:.1}",
            transform.x, transform.y, transform.z, transform.yaw
        );
    }
    for property in &object.properties {
        println!("  {}", format_property(property)?);
    }
    Ok(())
}

fn patch(
    store: &mut SaveStore,
    id: &Uuid,
    property: &str,
    occurrence: usize,
    value: &str,
    output: Option<&Path>,
) -> asa_core::Result<()> {
    let ctx = store.context()?;
    let mut patcher = Patcher::new(&ctx, store.get(id)?).with_options(store.options());
    let offset = patcher.locate(property, occurrence).ok_or_else(|| {
        SaveError::NotFound(format!("property {property} (occurrence {occurrence}) in {id}"))
    })?;
    let existing = patcher.property_at(offset)?;

    if existing.property_type() == PropertyType::Str {
        patcher.replace_string(offset, value)?;
    } else {
        let parsed = parse_value(&existing, value)?;
        patcher.replace_scalar(offset, &parsed)?;
    }
    store.put(id, patcher.as_bytes())?;

    match output {
        Some(path) => store.save_as(path)?,
        None => store.save()?,
    }
    let target = output.or(store.path()).map(Path::display);
    if let Some(target) = target {
        println!("Set {property} on {id}; wrote {target}");
    }
    Ok(())
}

fn cryopod(
    store: &mut SaveStore,
    id: &Uuid,
    options: DecodeOptions,
    json: bool,
) -> asa_core::Result<()> {
    let object = store.get_object(id)?;
    let archives = object.embedded_archives(options);
    if archives.is_empty() {
        return Err(SaveError::NotFound(format!("embedded archive in {id}")));
    }

    if json {
        let rows = archives
            .iter()
            .map(|archive| match archive {
                Ok(archive) => archive_json(archive),
                Err(e) => Ok(json!({ "error": e.to_string() })),
            })
            .collect::<asa_core::Result<Vec<_>>>()?;
        return print_json(&json!({ "id": id.to_string(), "archives": rows }));
    }

    for (i, archive) in archives.iter().enumerate() {
        match archive {
            Ok(archive) => {
                println!("Archive {i}: {} object(s)", archive.objects.len());
                for inner in &archive.objects {
                    println!("  {}  {}", inner.id, inner.class);
                    for property in &inner.properties {
                        println!("    {}", format_property(property)?);
                    }
                }
                for failed in &archive.failed {
                    println!("  {}  {}  (failed: {})", failed.id, failed.class, failed.error);
                }
            }
            Err(e) => println!("Archive {i}: {e}"),
        }
    }
    Ok(())
}

fn archive_json(archive: &Archive) -> asa_core::Result<JsonValue> {
    let failed: Vec<JsonValue> = archive
        .failed
        .iter()
        .map(|f| {
            json!({
                "id": f.id.to_string(),
                "class": f.class.to_string(),
                "error": f.error.to_string(),
            })
        })
        .collect();
    Ok(json!({
        "version": archive.version,
        "objects": to_json(&archive.objects)?,
        "failed": failed,
    }))
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

fn format_property(property: &Property) -> asa_core::Result<String> {
    let label = if property.position > 0 {
        format!("{}[{}]", property.name, property.position)
    } else {
        property.name.to_string()
    };
    let value = match &property.value {
        Value::Str(s) => format!("{s:?}"),
        Value::Name(name) => name.to_string(),
        Value::Enum(e) => e.to_string(),
        other => to_json(other)?.to_string(),
    };
    Ok(format!("{label} ({}) = {value}", property.type_name))
}

fn format_game_time(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let (days, rem) = (total / 86_400, total % 86_400);
    format!("{seconds:.1}s (day {}, {:02}:{:02})", days + 1, rem / 3600, rem % 3600 / 60)
}

/// Parse `text` as a replacement for `existing`'s value.
fn parse_value(existing: &Property, text: &str) -> asa_core::Result<Value> {
    fn parsed<T: std::str::FromStr>(name: &Name, text: &str) -> asa_core::Result<T> {
        text.parse()
            .map_err(|_| SaveError::invalid(format!("{text:?} is not a valid value for {name}")))
    }

    let name = &existing.name;
    Ok(match &existing.value {
        Value::Bool(_) => Value::Bool(parsed(name, text)?),
        Value::Int8(_) => Value::Int8(parsed(name, text)?),
        Value::Int16(_) => Value::Int16(parsed(name, text)?),
        Value::Int(_) => Value::Int(parsed(name, text)?),
        Value::Int64(_) => Value::Int64(parsed(name, text)?),
        Value::UInt16(_) => Value::UInt16(parsed(name, text)?),
        Value::UInt32(_) => Value::UInt32(parsed(name, text)?),
        Value::UInt64(_) => Value::UInt64(parsed(name, text)?),
        Value::Float(_) => Value::Float(parsed(name, text)?),
        Value::Double(_) => Value::Double(parsed(name, text)?),
        Value::Byte(_) => Value::Byte(parsed(name, text)?),
        Value::Name(_) => Value::Name(Name::new(text)),
        Value::Enum(e) => {
            let value = text
                .strip_prefix(&format!("{}::", e.enum_type))
                .unwrap_or(text);
            Value::Enum(EnumValue {
                enum_type: e.enum_type.clone(),
                value: Name::new(value),
            })
        }
        other => {
            return Err(SaveError::UnsupportedValueType {
                property: name.to_string(),
                value_type: other.property_type().to_string(),
            });
        }
    })
}
