//! Normalización de uplinks.
//!
//! Convierte el JSON de cada mensaje entrante en un `UplinkRecord` y lo envía a la
//! tarea del sink. Los eventos que no son uplinks (join, colas de downlink, estado)
//! se descartan en silencio; los mensajes malformados se descartan con un warning.


use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use crate::context::domain::AppContext;
use crate::system::domain::BridgeError;
use super::domain::{InboundMessage, RawDeviceEvent, UplinkRecord};


/// Extrae el registro canónico de un payload JSON.
///
/// # Retorno
/// * `Ok(Some(record))`: el evento trae `uplink_message` con `f_port`.
/// * `Ok(None)`: evento que no se registra.
/// * `Err(BridgeError::MalformedMessage)`: JSON inválido, identificadores ausentes,
///   `frm_payload` ausente o lista `rx_metadata` vacía.
pub fn normalize(raw: &[u8]) -> Result<Option<UplinkRecord>, BridgeError> {

    let event: RawDeviceEvent = serde_json::from_slice(raw)
        .map_err(|e| BridgeError::MalformedMessage(e.to_string()))?;

    let Some(uplink) = event.uplink_message else {
        return Ok(None);
    };

    let Some(f_port) = uplink.f_port else {
        return Ok(None);
    };

    let frm_payload = uplink.frm_payload.ok_or_else(|| {
        BridgeError::MalformedMessage("uplink_message sin frm_payload".to_string())
    })?;

    let first_report = uplink.rx_metadata.first().ok_or_else(|| {
        BridgeError::MalformedMessage("rx_metadata vacío".to_string())
    })?;

    Ok(Some(UplinkRecord {
        received_at: event.received_at,
        application_id: event.end_device_ids.application_ids.application_id,
        device_id: event.end_device_ids.device_id,
        f_port: Some(f_port),
        f_cnt: uplink.f_cnt,
        rssi: first_report.rssi,
        snr: first_report.snr,
        data_rate_index: uplink.settings.and_then(|s| s.data_rate_index),
        consumed_airtime: uplink.consumed_airtime.map(flatten_value),
        frm_payload,
        decoded_payload: uplink.decoded_payload.map(flatten_value),
    }))
}


/// Representación textual de un valor JSON libre. Con pérdida, solo informativa.
fn flatten_value(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}


#[instrument(
    name = "run_uplink_task",
    skip(tx, rx, app_context)
)]
pub async fn uplink_task(tx: mpsc::Sender<UplinkRecord>,
                         mut rx: mpsc::Receiver<InboundMessage>,
                         app_context: AppContext) {

    info!("Info: tarea uplink creada");

    while let Some(msg) = rx.recv().await {
        debug!(topic = %msg.topic, size = msg.payload.len(), "Debug: mensaje recibido");

        if app_context.system.is_development() {
            debug!("Debug: payload (compacto): {}", String::from_utf8_lossy(&msg.payload));
            if let Ok(value) = serde_json::from_slice::<Value>(&msg.payload) {
                if let Ok(pretty) = serde_json::to_string_pretty(&value) {
                    debug!("Debug: payload (expandido):\n{pretty}");
                }
            }
        }

        match normalize(&msg.payload) {
            Ok(Some(record)) => {
                if tx.send(record).await.is_err() {
                    error!("Error: no se pudo enviar el registro a sink_task");
                }
            }
            Ok(None) => {
                debug!(topic = %msg.topic, "Debug: evento sin uplink, no se registra");
            }
            Err(e) => {
                warn!(topic = %msg.topic, error = %e, "Warning: mensaje descartado");
            }
        }
    }

    info!("Info: tarea uplink finalizada");
}


pub fn start_uplink(tx_to_sink: mpsc::Sender<UplinkRecord>,
                    rx_from_session: mpsc::Receiver<InboundMessage>,
                    app_context: AppContext) -> JoinHandle<()> {

    tokio::spawn(async move {
        uplink_task(tx_to_sink,
                    rx_from_session,
                    app_context
        ).await;
    })
}
