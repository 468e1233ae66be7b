//! Dominio de Uplinks y Modelos de Datos.
//!
//! Este módulo define las estructuras que recorren el camino de subida:
//! el mensaje crudo tal como llega del broker, la vista tipada del JSON de
//! The Things Stack y el registro canónico que termina en el log diario.
//!


use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;


/// Mensaje PUBLISH recibido del broker, antes de interpretar su contenido.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}


/// Evento de dispositivo publicado por el servidor de red.
///
/// Solo se modela el subconjunto que consume el normalizador. Los campos
/// desconocidos se ignoran.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDeviceEvent {
    pub end_device_ids: EndDeviceIds,
    pub received_at: String,
    #[serde(default)]
    pub uplink_message: Option<RawUplinkMessage>,
}


#[derive(Debug, Clone, Deserialize)]
pub struct EndDeviceIds {
    pub device_id: String,
    pub application_ids: ApplicationIds,
}


#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationIds {
    pub application_id: String,
}


/// Sección `uplink_message`. Todo es opcional para no fallar con claves ausentes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawUplinkMessage {
    pub f_port: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    pub f_cnt: Option<u32>,
    pub frm_payload: Option<String>,
    pub decoded_payload: Option<Value>,
    #[serde(default)]
    pub rx_metadata: Vec<RxMetadata>,
    #[serde(default, deserialize_with = "lenient")]
    pub settings: Option<TxSettings>,
    pub consumed_airtime: Option<Value>,
}


/// Reporte de recepción de un gateway.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RxMetadata {
    #[serde(default, deserialize_with = "lenient")]
    pub rssi: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub snr: Option<f64>,
}


#[derive(Debug, Clone, Default, Deserialize)]
pub struct TxSettings {
    #[serde(default, deserialize_with = "lenient")]
    pub data_rate_index: Option<u32>,
}


/// Campo opcional tolerante: un valor con tipo inesperado se trata como ausente
/// en lugar de invalidar el uplink completo.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}


/// Registro canónico de un uplink.
///
/// `None` representa el marcador de ausencia y se escribe como `-`.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkRecord {
    pub received_at: String,
    pub application_id: String,
    pub device_id: String,
    pub f_port: Option<u32>,
    pub f_cnt: Option<u32>,
    pub rssi: Option<f64>,
    pub snr: Option<f64>,
    pub data_rate_index: Option<u32>,
    pub consumed_airtime: Option<String>,
    pub frm_payload: String,
    pub decoded_payload: Option<String>,
}
