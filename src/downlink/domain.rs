//! Dominio de Downlinks.
//!
//! Un `DownlinkCommand` describe qué bytes enviar a un dispositivo, por qué puerto
//! y con qué prioridad. El codificador lo convierte en el JSON que espera
//! The Things Stack en el tópico `down/push`.


use base64::{engine::general_purpose::STANDARD, Engine};
use clap::ValueEnum;
use serde::Serialize;


/// Prioridad de encolado del downlink en el servidor de red.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[value(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
}


/// Comando para un dispositivo concreto.
///
/// El rango de `f_port` (1..=255) lo valida quien construye el comando.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownlinkCommand {
    pub device_id: String,
    pub f_port: u8,
    pub payload: Vec<u8>,
    pub priority: Priority,
}


#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownlinkEntry {
    pub f_port: u8,
    pub frm_payload: String,
    pub priority: Priority,
}


/// Cuerpo del mensaje: `{"downlinks":[...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownlinkEnvelope {
    pub downlinks: Vec<DownlinkEntry>,
}


/// Mensaje listo para publicar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub device_id: String,
    pub body: Vec<u8>,
}


/// Codifica el comando. El payload va en base64 estándar dentro del JSON.
pub fn encode(command: &DownlinkCommand) -> Result<EncodedMessage, serde_json::Error> {
    let envelope = DownlinkEnvelope {
        downlinks: vec![DownlinkEntry {
            f_port: command.f_port,
            frm_payload: STANDARD.encode(&command.payload),
            priority: command.priority,
        }],
    };

    Ok(EncodedMessage {
        device_id: command.device_id.clone(),
        body: serde_json::to_vec(&envelope)?,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_scenario_encoding() {
        let command = DownlinkCommand {
            device_id: "eui-BBB".to_string(),
            f_port: 3,
            payload: vec![0x00],
            priority: Priority::Normal,
        };

        let encoded = encode(&command).unwrap();
        assert_eq!(encoded.device_id, "eui-BBB");
        assert_eq!(
            String::from_utf8(encoded.body).unwrap(),
            r#"{"downlinks":[{"f_port":3,"frm_payload":"AA==","priority":"NORMAL"}]}"#
        );
    }

    #[test]
    fn test_payload_survives_base64() {
        let payload: Vec<u8> = (0..=255).collect();
        let command = DownlinkCommand {
            device_id: "eui-BBB".to_string(),
            f_port: 200,
            payload: payload.clone(),
            priority: Priority::Highest,
        };

        let encoded = encode(&command).unwrap();
        let body: Value = serde_json::from_slice(&encoded.body).unwrap();
        let entry = &body["downlinks"][0];

        let decoded = STANDARD.decode(entry["frm_payload"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(entry["f_port"], 200);
        assert_eq!(entry["priority"], "HIGHEST");
    }

    #[test]
    fn test_priority_names() {
        for (priority, name) in [
            (Priority::Lowest, "\"LOWEST\""),
            (Priority::Low, "\"LOW\""),
            (Priority::Normal, "\"NORMAL\""),
            (Priority::High, "\"HIGH\""),
            (Priority::Highest, "\"HIGHEST\""),
        ] {
            assert_eq!(serde_json::to_string(&priority).unwrap(), name);
        }
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
