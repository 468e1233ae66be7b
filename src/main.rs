use std::process::ExitCode;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use crate::channels::domain::Channels;
use crate::context::domain::AppContext;
use crate::downlink::domain::{DownlinkCommand, Priority};
use crate::downlink::logic::{run_downlink};
use crate::session::logic::{run_session};
use crate::sink::logic::{start_sink};
use crate::system::domain::{init_tracing, BridgeError, System};
use crate::uplink::logic::{start_uplink};

mod channels;
mod config;
mod context;
mod downlink;
mod session;
mod sink;
mod system;
mod uplink;


#[derive(Parser, Debug)]
#[command(author, version, about = "Puente entre el broker MQTT de The Things Stack y un log diario tabulado")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}


#[derive(Subcommand, Debug)]
enum Command {
    /// Recibe uplinks y los agrega al log diario hasta Ctrl-C.
    Listen,

    /// Envía un downlink a un dispositivo y termina.
    Send {
        /// Dispositivo destino. Por defecto `TTN_DEVICE_ID`.
        #[arg(long)]
        device_id: Option<String>,

        /// Puerto LoRaWAN (1-255).
        #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..))]
        f_port: u8,

        /// Payload en hexadecimal (ej. `00`, `01ff`).
        #[arg(long, default_value = "00")]
        payload: String,

        #[arg(long, value_enum, ignore_case = true, default_value_t = Priority::Normal)]
        priority: Priority,
    },
}


#[tokio::main]
async fn main() -> ExitCode {

    let cli = Cli::parse();

    let system = match System::new() {
        Ok(system) => system,
        Err(e) => {
            eprintln!("Error: {e}");
            return e.exit_code();
        }
    };

    init_tracing(&system);

    let app_context = AppContext::new(system);
    let shutdown = CancellationToken::new();

    watch_interrupt(shutdown.clone());

    match cli.command {
        Command::Listen => {
            run_listen(app_context, shutdown).await
        }
        Command::Send { device_id, f_port, payload, priority } => {
            run_send(app_context, shutdown, device_id, f_port, payload, priority).await
        }
    }
}


fn watch_interrupt(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Info: interrupción del operador recibida");
                shutdown.cancel();
            }
            Err(e) => error!("Error: no se pudo escuchar Ctrl-C. {e}"),
        }
    });
}


async fn run_listen(app_context: AppContext,
                    shutdown: CancellationToken) -> ExitCode {

    let channels = Channels::new();

    let uplink = start_uplink(channels.uplink_to_sink,
                              channels.uplink_from_session,
                              app_context.clone());

    let sink = start_sink(channels.sink_from_uplink,
                          app_context.clone());

    let result = run_session(channels.session_to_uplink,
                             app_context,
                             shutdown).await;

    // Al cerrar la sesión se cierran los canales; se esperan los registros pendientes.
    for (name, handle) in [("uplink", uplink), ("sink", sink)] {
        if let Err(e) = handle.await {
            error!("Error: la tarea {name} terminó con pánico. {e}");
        }
    }

    match result {
        Ok(()) => {
            info!("Info: salida limpia");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: sesión terminada. {e}");
            e.exit_code()
        }
    }
}


async fn run_send(app_context: AppContext,
                  shutdown: CancellationToken,
                  device_id: Option<String>,
                  f_port: u8,
                  payload: String,
                  priority: Priority) -> ExitCode {

    let Some(device_id) = device_id.or_else(|| app_context.system.device_id.clone()) else {
        let e = BridgeError::Config("falta --device-id o TTN_DEVICE_ID".to_string());
        error!("Error: {e}");
        return e.exit_code();
    };

    let payload = match hex::decode(payload.trim()) {
        Ok(bytes) => bytes,
        Err(err) => {
            let e = BridgeError::Config(format!("payload hexadecimal inválido: {err}"));
            error!("Error: {e}");
            return e.exit_code();
        }
    };

    let command = DownlinkCommand { device_id, f_port, payload, priority };

    match run_downlink(app_context, command, shutdown.clone()).await {
        Ok(outcome) if outcome.is_accepted() => ExitCode::SUCCESS,
        Ok(_) if shutdown.is_cancelled() => {
            info!("Info: envío interrumpido por el operador");
            ExitCode::SUCCESS
        }
        Ok(outcome) => {
            warn!("Warning: downlink no enviado: {outcome:?}");
            ExitCode::from(1)
        }
        Err(e) => {
            error!("Error: {e}");
            e.exit_code()
        }
    }
}
