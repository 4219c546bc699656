//! trilive-track: follow one bus or train to a stop from the terminal.
//!
//! ## Subcommands
//!
//! - `arrivals`: list upcoming arrivals at a stop
//! - `track`: commit to the next arrival and follow it until it arrives
//! - `init-config`: write the default engine config to a file

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use tokio::sync::mpsc;
use tokio::time;

use trilive_lib::notifications::DeliveredNotification;
use trilive_lib::{
    init_logging, AlwaysGranted, ArrivalEstimate, ArrivalFeed, Clock, EngineConfig,
    HttpTransitClient, RouteId, StopId, SystemClock, TimerNotificationSink, TrackingManager,
    TrackingServices, TrackingStatus, VehicleId,
};

#[derive(Parser)]
#[command(name = "trilive-track")]
#[command(about = "Live arrival tracking for a single transit stop")]
#[command(version)]
struct Cli {
    /// Base URL of the TriLive backend
    #[arg(long, global = true, default_value = "http://localhost:8080")]
    base_url: String,

    /// Engine config file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List upcoming arrivals at a stop
    Arrivals {
        #[arg(long)]
        stop: String,

        /// Only show this route
        #[arg(long)]
        route: Option<String>,
    },

    /// Track the next arrival of a route at a stop
    Track {
        #[arg(long)]
        stop: String,

        #[arg(long)]
        route: String,

        /// Follow this vehicle instead of the soonest one
        #[arg(long)]
        vehicle: Option<String>,

        /// Stop name used in alerts
        #[arg(long)]
        stop_name: Option<String>,
    },

    /// Write the default engine config
    InitConfig {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;
    init_logging(cli.debug || config.debug);

    match cli.command {
        Commands::Arrivals { stop, route } => {
            list_arrivals(&cli.base_url, StopId::new(stop), route.map(RouteId::new)).await
        }
        Commands::Track {
            stop,
            route,
            vehicle,
            stop_name,
        } => {
            track(
                &cli.base_url,
                config,
                StopId::new(stop),
                RouteId::new(route),
                vehicle.map(VehicleId::new),
                stop_name,
            )
            .await
        }
        Commands::InitConfig { path } => {
            EngineConfig::default().save(&path)?;
            println!("Wrote default config to {}", path.display());
            Ok(())
        }
    }
}

async fn list_arrivals(base_url: &str, stop: StopId, route: Option<RouteId>) -> Result<()> {
    let clock = Arc::new(SystemClock);
    let client = HttpTransitClient::new(base_url).with_clock(clock.clone());
    let arrivals = ArrivalFeed::fetch(&client, &stop, route.as_ref())
        .await
        .with_context(|| format!("Failed to load arrivals for stop {stop}"))?;

    if arrivals.is_empty() {
        println!("No upcoming arrivals at stop {stop}");
        return Ok(());
    }

    let now = clock.now();
    for arrival in arrivals {
        println!(
            "{:>6}  vehicle {:<8} {:>3} min  {}",
            arrival.display_route(),
            arrival.vehicle_id,
            arrival.minutes_until(now),
            arrival.status.as_str()
        );
    }
    Ok(())
}

async fn track(
    base_url: &str,
    config: EngineConfig,
    stop: StopId,
    route: RouteId,
    vehicle: Option<VehicleId>,
    stop_name: Option<String>,
) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let client = Arc::new(HttpTransitClient::new(base_url).with_clock(clock.clone()));

    let arrivals = ArrivalFeed::fetch(client.as_ref(), &stop, Some(&route))
        .await
        .with_context(|| format!("Failed to load arrivals for stop {stop}"))?;
    let estimate = pick_arrival(arrivals, vehicle.as_ref(), clock.as_ref())
        .ok_or_else(|| anyhow!("no upcoming arrival of route {route} at stop {stop}"))?;

    let (sink, mut delivered) = TimerNotificationSink::new(clock.clone());
    let services = TrackingServices {
        arrivals: client.clone(),
        vehicles: client,
        sink: Arc::new(sink),
        permission: Arc::new(AlwaysGranted),
        clock,
    };
    let manager = TrackingManager::new(services, config);
    let controller = manager.start_tracking(estimate, stop_name).await?;
    let mut progress = controller.subscribe_progress();
    let mut last_minutes = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; stopping tracking");
                manager.stop().await?;
                break;
            }
            Some(notification) = delivered.recv() => print_alert(&notification),
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = progress.borrow_and_update().clone();
                if snapshot.status == TrackingStatus::Stopped {
                    break;
                }
                if last_minutes != Some(snapshot.minutes_remaining) {
                    last_minutes = Some(snapshot.minutes_remaining);
                    println!(
                        "{:>3} min  {:>5.1}%{}",
                        snapshot.minutes_remaining,
                        snapshot.fraction * 100.0,
                        if snapshot.data_stale { "  (stale)" } else { "" }
                    );
                }
            }
        }
    }

    for notification in drain_alerts(&mut delivered).await {
        print_alert(&notification);
    }
    if let Some(session) = controller.session() {
        let reason = session.stop_reason.map(|reason| reason.as_str()).unwrap_or("-");
        println!("Session {} ended: {reason}", session.id);
    }
    Ok(())
}

fn pick_arrival(
    arrivals: Vec<ArrivalEstimate>,
    vehicle: Option<&VehicleId>,
    clock: &dyn Clock,
) -> Option<ArrivalEstimate> {
    let now = clock.now();
    arrivals
        .into_iter()
        .filter(|arrival| vehicle.map_or(true, |vehicle| &arrival.vehicle_id == vehicle))
        .filter(|arrival| arrival.effective_time() > now)
        .min_by_key(ArrivalEstimate::effective_time)
}

fn print_alert(notification: &DeliveredNotification) {
    println!(
        "** {} {}",
        notification.payload.title, notification.payload.body
    );
}

/// The arrival alert fires at the same instant the session stops, so its timer
/// may not have sent yet when the loop exits. Waits a short grace period
/// after each alert.
async fn drain_alerts(
    delivered: &mut mpsc::UnboundedReceiver<DeliveredNotification>,
) -> Vec<DeliveredNotification> {
    let mut alerts = Vec::new();
    while let Ok(Some(notification)) = time::timeout(ALERT_GRACE, delivered.recv()).await {
        alerts.push(notification);
    }
    alerts
}

const ALERT_GRACE: Duration = Duration::from_millis(250);
