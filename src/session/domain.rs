//! Dominio de la sesión MQTT.
//!
//! Define el direccionamiento de tópicos de The Things Stack, la máquina de estados
//! de la sesión, el enum único de eventos que consume el bucle de despacho y el
//! trait `BusClient` detrás del cual queda el cliente MQTT real.


use std::fmt;
use async_trait::async_trait;
use rumqttc::{ConnectReturnCode, ConnectionError, Event, Packet, QoS, SubscribeReasonCode};
use crate::config::topic::{ALL_TOPICS, DOWNLINK_PUSH, NAMESPACE, RESOURCE, UPLINK};
use crate::system::domain::BridgeError;


/// Selección de dispositivos para la suscripción de uplinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Todos los tópicos visibles para el usuario (`#`).
    All,
    Device(String),
}


/// Dirección de un tópico dentro del espacio `v3/<usuario>/devices/...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicAddress {
    Uplink { principal: String, device: DeviceSelector },
    DownlinkPush { principal: String, device_id: String },
}


impl TopicAddress {
    pub fn uplink(principal: &str, device: DeviceSelector) -> Self {
        TopicAddress::Uplink { principal: principal.to_string(), device }
    }

    pub fn downlink_push(principal: &str, device_id: &str) -> Self {
        TopicAddress::DownlinkPush {
            principal: principal.to_string(),
            device_id: device_id.to_string(),
        }
    }
}


impl fmt::Display for TopicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicAddress::Uplink { device: DeviceSelector::All, .. } => f.write_str(ALL_TOPICS),
            TopicAddress::Uplink { principal, device: DeviceSelector::Device(device_id) } => {
                write!(f, "{NAMESPACE}/{principal}/{RESOURCE}/{device_id}/{UPLINK}")
            }
            TopicAddress::DownlinkPush { principal, device_id } => {
                write!(f, "{NAMESPACE}/{principal}/{RESOURCE}/{device_id}/{DOWNLINK_PUSH}")
            }
        }
    }
}


/// Suscripción configurada. Se reemite tras cada CONNACK.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Running,
    ShuttingDown,
}


/// Eventos que el bucle de despacho entrega a la sesión, en orden de llegada.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Respuesta del broker al CONNECT (aceptada o rechazada).
    ConnAck(ConnectReturnCode),
    SubAck(Vec<SubscribeReasonCode>),
    Message { topic: String, qos: QoS, payload: Vec<u8> },
    /// Pérdida de la conexión de red.
    ConnectionLost(String),
}


/// Resultado local de una publicación. No refleja la entrega remota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    Rejected(String),
}


impl PublishOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PublishOutcome::Accepted)
    }
}


/// Operaciones que la sesión necesita del cliente MQTT.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BridgeError>;

    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), BridgeError>;

    async fn disconnect(&self) -> Result<(), BridgeError>;
}


/// Clasifica un CONNACK rechazado.
pub fn refused_error(code: ConnectReturnCode) -> BridgeError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            BridgeError::Authentication(format!("{code:?}"))
        }
        other => BridgeError::Connection(format!("conexión rechazada: {other:?}")),
    }
}


/// Traduce un resultado del event loop de rumqttc a un `SessionEvent`.
///
/// Devuelve `Ok(None)` para tráfico que la sesión no necesita (pings, paquetes salientes).
/// Un DISCONNECT del broker también se ignora: el error de socket que le sigue
/// es el que dispara la reconexión.
/// Los fallos TLS son fatales y se devuelven como error.
pub fn translate(polled: Result<Event, ConnectionError>) -> Result<Option<SessionEvent>, BridgeError> {
    match polled {
        Ok(Event::Incoming(Packet::ConnAck(ack))) => Ok(Some(SessionEvent::ConnAck(ack.code))),
        Ok(Event::Incoming(Packet::SubAck(ack))) => Ok(Some(SessionEvent::SubAck(ack.return_codes))),
        Ok(Event::Incoming(Packet::Publish(publish))) => Ok(Some(SessionEvent::Message {
            topic: publish.topic,
            qos: publish.qos,
            payload: publish.payload.to_vec(),
        })),
        Ok(_) => Ok(None),
        Err(ConnectionError::ConnectionRefused(code)) => Ok(Some(SessionEvent::ConnAck(code))),
        Err(ConnectionError::Tls(e)) => Err(BridgeError::Connection(format!("TLS: {e}"))),
        Err(e) => Ok(Some(SessionEvent::ConnectionLost(e.to_string()))),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Publish, SubAck};

    #[test]
    fn test_uplink_topic_for_device() {
        let topic = TopicAddress::uplink("my-app@ttn", DeviceSelector::Device("eui-AAA".to_string()));
        assert_eq!(topic.to_string(), "v3/my-app@ttn/devices/eui-AAA/up");
    }

    #[test]
    fn test_uplink_topic_for_all_devices() {
        let topic = TopicAddress::uplink("my-app@ttn", DeviceSelector::All);
        assert_eq!(topic.to_string(), "#");
    }

    #[test]
    fn test_downlink_push_topic() {
        let topic = TopicAddress::downlink_push("my-app@ttn", "eui-BBB");
        assert_eq!(topic.to_string(), "v3/my-app@ttn/devices/eui-BBB/down/push");
    }

    #[test]
    fn test_refused_error_classification() {
        assert!(matches!(
            refused_error(ConnectReturnCode::BadUserNamePassword),
            BridgeError::Authentication(_)
        ));
        assert!(matches!(
            refused_error(ConnectReturnCode::NotAuthorized),
            BridgeError::Authentication(_)
        ));
        assert!(matches!(
            refused_error(ConnectReturnCode::ServiceUnavailable),
            BridgeError::Connection(_)
        ));
    }

    #[test]
    fn test_translate_incoming_packets() {
        let connack = translate(Ok(Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )))))
        .unwrap();
        assert_eq!(connack, Some(SessionEvent::ConnAck(ConnectReturnCode::Success)));

        let suback = translate(Ok(Event::Incoming(Packet::SubAck(SubAck::new(
            1,
            vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
        )))))
        .unwrap();
        assert_eq!(
            suback,
            Some(SessionEvent::SubAck(vec![SubscribeReasonCode::Success(QoS::AtMostOnce)]))
        );

        let publish = translate(Ok(Event::Incoming(Packet::Publish(Publish::new(
            "v3/my-app@ttn/devices/eui-AAA/up",
            QoS::AtMostOnce,
            b"{}".to_vec(),
        )))))
        .unwrap();
        assert_eq!(
            publish,
            Some(SessionEvent::Message {
                topic: "v3/my-app@ttn/devices/eui-AAA/up".to_string(),
                qos: QoS::AtMostOnce,
                payload: b"{}".to_vec(),
            })
        );

        assert_eq!(translate(Ok(Event::Incoming(Packet::PingResp))).unwrap(), None);
        assert_eq!(translate(Ok(Event::Incoming(Packet::Disconnect))).unwrap(), None);
    }

    #[test]
    fn test_translate_connection_errors() {
        let refused = translate(Err(ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword,
        )))
        .unwrap();
        assert_eq!(
            refused,
            Some(SessionEvent::ConnAck(ConnectReturnCode::BadUserNamePassword))
        );

        let lost = translate(Err(ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))))
        .unwrap();
        assert!(matches!(lost, Some(SessionEvent::ConnectionLost(_))));
    }
}
