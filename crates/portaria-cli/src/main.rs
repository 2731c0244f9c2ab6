use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use portaria_core::plate::{self, PlateFormat};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "portaria", about = "Portaria gatehouse CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show gate states and daemon status
    Status,
    /// Open or close a gate by hand
    Gate {
        #[command(subcommand)]
        action: GateAction,
    },
    /// Show the access log, newest first
    Log {
        #[arg(short, long, default_value_t = 1)]
        page: u32,
        /// Entries per page (0 uses the daemon default)
        #[arg(long, default_value_t = 0)]
        page_size: u32,
        /// Only entry or exit records
        #[arg(short, long)]
        direction: Option<String>,
        /// today, week, month or an RFC 3339 timestamp
        #[arg(short, long)]
        since: Option<String>,
    },
    /// Search residents by name or unit
    Residents {
        #[arg(default_value = "")]
        term: String,
        #[arg(short, long)]
        block: Option<String>,
    },
    /// List known blocks
    Blocks,
    /// Register an access by hand
    Register {
        /// Resident id
        id: String,
        /// entry or exit (alternates from the last record when omitted)
        #[arg(short, long)]
        direction: Option<String>,
        #[arg(short, long, default_value = "")]
        note: String,
    },
    /// Seconds until a resident may be registered again
    Cooldown { id: String },
    /// Enroll a new resident
    Enroll {
        #[arg(long)]
        name: String,
        #[arg(long)]
        apartment: String,
        #[arg(long)]
        block: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        email: Option<String>,
        /// JSON file holding the face descriptor (array of floats)
        #[arg(long)]
        descriptor: Option<PathBuf>,
        #[arg(long)]
        plate: Option<String>,
        #[arg(long, default_value = "", requires = "plate")]
        model: String,
        #[arg(long, requires = "plate")]
        color: Option<String>,
        #[arg(long, requires = "plate")]
        spot: Option<String>,
    },
    /// Edit a resident's details
    Update {
        /// Resident id
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        apartment: Option<String>,
        #[arg(long)]
        block: Option<String>,
        /// New phone ("" clears it)
        #[arg(long)]
        phone: Option<String>,
        /// New email ("" clears it)
        #[arg(long)]
        email: Option<String>,
        /// JSON file holding a replacement face descriptor
        #[arg(long)]
        descriptor: Option<PathBuf>,
    },
    /// Extract a plate from OCR text
    Plate {
        text: String,
        /// Submit the reading to the daemon instead of only parsing it
        #[arg(long)]
        submit: bool,
    },
    /// Start or stop a camera loop
    Camera {
        #[command(subcommand)]
        action: CameraAction,
    },
    /// Reload residents from the database
    Reload,
}

#[derive(Subcommand)]
enum GateAction {
    /// pedestrian or vehicle
    Open { gate: String },
    /// pedestrian or vehicle
    Close { gate: String },
}

#[derive(Subcommand)]
enum CameraAction {
    /// face or plate
    Activate { camera: String },
    /// face or plate
    Deactivate { camera: String },
}

#[zbus::proxy(
    interface = "org.portaria.Gatehouse1",
    default_service = "org.portaria.Gatehouse1",
    default_path = "/org/portaria/Gatehouse1"
)]
trait Gatehouse {
    async fn status(&self) -> zbus::Result<String>;
    async fn open_gate(&self, gate: &str) -> zbus::Result<String>;
    async fn close_gate(&self, gate: &str) -> zbus::Result<String>;
    async fn submit_plate_text(&self, text: &str) -> zbus::Result<String>;
    async fn register_access(&self, identity_id: &str, direction: &str, note: &str) -> zbus::Result<String>;
    async fn enroll(&self, enrollment_json: &str) -> zbus::Result<String>;
    async fn update_resident(&self, identity_id: &str, update_json: &str) -> zbus::Result<String>;
    async fn residents(&self, term: &str, block: &str) -> zbus::Result<String>;
    async fn blocks(&self) -> zbus::Result<Vec<String>>;
    async fn records(&self, page: u32, page_size: u32, direction: &str, since: &str) -> zbus::Result<String>;
    async fn cooldown_remaining(&self, identity_id: &str) -> zbus::Result<u64>;
    async fn activate_camera(&self, camera: &str) -> zbus::Result<()>;
    async fn deactivate_camera(&self, camera: &str) -> zbus::Result<bool>;
    async fn reload_registry(&self) -> zbus::Result<u32>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Parsing a plate needs no daemon.
    if let Commands::Plate { text, submit: false } = &cli.command {
        print_plate(text);
        return Ok(());
    }

    let proxy = connect(cli.session).await?;

    match cli.command {
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Gate { action } => {
            let reply = match action {
                GateAction::Open { gate } => proxy.open_gate(&gate).await?,
                GateAction::Close { gate } => proxy.close_gate(&gate).await?,
            };
            print_json(&reply)?;
        }
        Commands::Log {
            page,
            page_size,
            direction,
            since,
        } => {
            let reply = proxy
                .records(
                    page,
                    page_size,
                    direction.as_deref().unwrap_or(""),
                    since.as_deref().unwrap_or(""),
                )
                .await?;
            print_log(&reply)?
        }
        Commands::Residents { term, block } => {
            print_json(&proxy.residents(&term, block.as_deref().unwrap_or("")).await?)?
        }
        Commands::Blocks => {
            for block in proxy.blocks().await? {
                println!("{block}");
            }
        }
        Commands::Register { id, direction, note } => {
            let reply = proxy
                .register_access(&id, direction.as_deref().unwrap_or(""), &note)
                .await?;
            print_json(&reply)?;
        }
        Commands::Cooldown { id } => match proxy.cooldown_remaining(&id).await? {
            0 => println!("Free to register"),
            secs => println!("Wait {secs} seconds"),
        },
        Commands::Enroll {
            name,
            apartment,
            block,
            phone,
            email,
            descriptor,
            plate,
            model,
            color,
            spot,
        } => {
            let descriptor = descriptor.map(read_descriptor).transpose()?;
            let vehicles: Vec<Value> = plate
                .map(|plate| json!({ "plate": plate, "model": model, "color": color, "parking_spot": spot }))
                .into_iter()
                .collect();
            let request = json!({
                "name": name,
                "apartment": apartment,
                "block": block,
                "phone": phone,
                "email": email,
                "descriptor": descriptor,
                "vehicles": vehicles,
            });
            print_json(&proxy.enroll(&request.to_string()).await?)?;
        }
        Commands::Update {
            id,
            name,
            apartment,
            block,
            phone,
            email,
            descriptor,
        } => {
            let descriptor = descriptor.map(read_descriptor).transpose()?;
            let request = update_request(name, apartment, block, phone, email, descriptor);
            if request.as_object().is_some_and(|fields| fields.is_empty()) {
                bail!("nothing to update");
            }
            print_json(&proxy.update_resident(&id, &request.to_string()).await?)?;
        }
        Commands::Plate { text, .. } => print_json(&proxy.submit_plate_text(&text).await?)?,
        Commands::Camera { action } => match action {
            CameraAction::Activate { camera } => {
                proxy.activate_camera(&camera).await?;
                println!("{camera} camera active");
            }
            CameraAction::Deactivate { camera } => {
                if proxy.deactivate_camera(&camera).await? {
                    println!("{camera} camera stopped");
                } else {
                    println!("{camera} camera was not running");
                }
            }
        },
        Commands::Reload => {
            let count = proxy.reload_registry().await?;
            println!("{count} residents loaded");
        }
    }

    Ok(())
}

async fn connect(session: bool) -> Result<GatehouseProxy<'static>> {
    let builder = if session {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let conn = builder
        .method_timeout(Duration::from_secs(5))
        .build()
        .await
        .context("failed to connect to D-Bus")?;
    GatehouseProxy::new(&conn)
        .await
        .context("portariad is not reachable")
}

fn read_descriptor(path: PathBuf) -> Result<Vec<f32>> {
    let text = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let values: Vec<f32> = serde_json::from_str(&text).with_context(|| format!("{} is not a JSON float array", path.display()))?;
    if values.is_empty() {
        bail!("{} holds an empty descriptor", path.display());
    }
    Ok(values)
}

/// JSON object holding only the fields that were given.
fn update_request(
    name: Option<String>,
    apartment: Option<String>,
    block: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    descriptor: Option<Vec<f32>>,
) -> Value {
    let mut fields = serde_json::Map::new();
    let text = [("name", name), ("apartment", apartment), ("block", block), ("phone", phone), ("email", email)];
    for (key, value) in text {
        if let Some(value) = value {
            fields.insert(key.into(), Value::String(value));
        }
    }
    if let Some(descriptor) = descriptor {
        fields.insert("descriptor".into(), json!(descriptor));
    }
    Value::Object(fields)
}

fn print_plate(text: &str) {
    match plate::normalize(text) {
        Some(code) => {
            let layout = match code.format() {
                PlateFormat::Legacy => "legacy",
                PlateFormat::Mercosul => "mercosul",
            };
            println!("{code} ({layout})");
        }
        None => println!("No plate found"),
    }
}

fn print_json(raw: &str) -> Result<()> {
    let value: Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_log(raw: &str) -> Result<()> {
    let page: Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    let records = page["records"].as_array().cloned().unwrap_or_default();
    if records.is_empty() {
        println!("No access records");
        return Ok(());
    }
    for record in &records {
        println!(
            "{}  {:<5}  {}  {}",
            record["created_at"].as_str().unwrap_or("-"),
            record["direction"].as_str().unwrap_or("-"),
            record["identity_id"].as_str().unwrap_or("-"),
            record["method"].as_str().unwrap_or("-"),
        );
    }
    println!(
        "page {} of {} ({} records)",
        page["page"],
        page["total_pages"],
        page["total"]
    );
    Ok(())
}
