//! Publicación de downlinks.
//!
//! El publicador resuelve el tópico `down/push` del dispositivo y entrega el
//! mensaje codificado a la sesión para un único envío de mejor esfuerzo.


use std::sync::Arc;
use rumqttc::{Event, EventLoop, Outgoing, QoS};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use crate::config::mqtt::DOWNLINK_TIMEOUT;
use crate::context::domain::AppContext;
use crate::session::domain::{translate, PublishOutcome, SessionState, TopicAddress};
use crate::session::logic::{create_client, drain_disconnect, Session};
use crate::system::domain::BridgeError;
use super::domain::{encode, DownlinkCommand};


#[derive(Debug, Clone)]
pub struct DownlinkPublisher {
    principal: String,
    qos: QoS,
}


impl DownlinkPublisher {
    pub fn new(principal: &str, qos: QoS) -> Self {
        Self { principal: principal.to_string(), qos }
    }

    /// Codifica y publica una vez. No espera confirmación de entrega.
    pub async fn send(&self, session: &Session, command: &DownlinkCommand) -> PublishOutcome {

        let encoded = match encode(command) {
            Ok(encoded) => encoded,
            Err(e) => return PublishOutcome::Rejected(e.to_string()),
        };

        let topic = TopicAddress::downlink_push(&self.principal, &encoded.device_id).to_string();

        debug!(topic = %topic, body = %String::from_utf8_lossy(&encoded.body), "Debug: downlink codificado");

        let outcome = session.publish(&topic, encoded.body, self.qos).await;

        match &outcome {
            PublishOutcome::Accepted => {
                info!(topic = %topic, f_port = command.f_port, "Info: downlink aceptado por el cliente");
            }
            PublishOutcome::Rejected(reason) => {
                error!(topic = %topic, reason = %reason, "Error: no se pudo enviar el downlink");
            }
        }
        outcome
    }
}


/// Conecta, publica el comando una vez y cierra la sesión.
#[instrument(
    name = "run_downlink_task",
    skip_all,
    fields(device_id = %command.device_id)
)]
pub async fn run_downlink(app_context: AppContext,
                          command: DownlinkCommand,
                          shutdown: CancellationToken) -> Result<PublishOutcome, BridgeError> {

    let system = &app_context.system;
    let (client, mut eventloop) = create_client(system)?;
    let mut session = Session::new(Arc::new(client), Vec::new());
    let publisher = DownlinkPublisher::new(&system.principal, system.qos);

    info!("Info: conectando al broker {}:{}", system.host, system.port);
    session.begin_connect();

    match timeout(
        DOWNLINK_TIMEOUT,
        drive_downlink(&mut eventloop, &mut session, &publisher, &command, &shutdown),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!("Warning: tiempo agotado esperando el envío del downlink");
            if session.disconnect().await {
                drain_disconnect(&mut eventloop).await;
            }
            Err(BridgeError::Connection("tiempo agotado enviando el downlink".to_string()))
        }
    }
}


async fn drive_downlink(eventloop: &mut EventLoop,
                        session: &mut Session,
                        publisher: &DownlinkPublisher,
                        command: &DownlinkCommand,
                        shutdown: &CancellationToken) -> Result<PublishOutcome, BridgeError> {

    let mut outcome: Option<PublishOutcome> = None;

    loop {
        let polled = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Info: parada solicitada, desconectando");
                if session.disconnect().await {
                    drain_disconnect(eventloop).await;
                }
                session.finish();
                return Ok(outcome.unwrap_or_else(|| PublishOutcome::Rejected("interrumpido".to_string())));
            }
            polled = eventloop.poll() => polled,
        };

        match &polled {
            Ok(Event::Outgoing(Outgoing::Publish(_))) => {
                debug!("Debug: PUBLISH escrito en el socket");
                if !session.disconnect().await {
                    session.finish();
                    return Ok(outcome.unwrap_or(PublishOutcome::Accepted));
                }
                continue;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                session.finish();
                return Ok(outcome.unwrap_or(PublishOutcome::Accepted));
            }
            Err(_) if session.state() == SessionState::ShuttingDown => {
                session.finish();
                return Ok(outcome.unwrap_or(PublishOutcome::Accepted));
            }
            _ => {}
        }

        let Some(event) = translate(polled)? else {
            continue;
        };
        session.handle_event(event).await?;

        if outcome.is_none() && session.state() == SessionState::Running {
            let result = publisher.send(session, command).await;
            if !result.is_accepted() {
                if session.disconnect().await {
                    drain_disconnect(eventloop).await;
                }
                session.finish();
                return Ok(result);
            }
            outcome = Some(result);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::downlink::domain::Priority;
    use crate::session::domain::{MockBusClient, SessionEvent};
    use rumqttc::ConnectReturnCode;

    fn command() -> DownlinkCommand {
        DownlinkCommand {
            device_id: "eui-BBB".to_string(),
            f_port: 3,
            payload: vec![0x00],
            priority: Priority::Normal,
        }
    }

    #[tokio::test]
    async fn test_send_publishes_to_device_topic() {
        let mut mock = MockBusClient::new();
        mock.expect_publish()
            .withf(|topic: &str, qos: &QoS, payload: &Vec<u8>| {
                topic == "v3/myapp@ttn/devices/eui-BBB/down/push"
                    && *qos == QoS::AtMostOnce
                    && payload.as_slice()
                        == br#"{"downlinks":[{"f_port":3,"frm_payload":"AA==","priority":"NORMAL"}]}"#
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut session = Session::new(Arc::new(mock), Vec::new());
        session.begin_connect();
        session.handle_event(SessionEvent::ConnAck(ConnectReturnCode::Success)).await.unwrap();
        assert_eq!(session.state(), SessionState::Running);

        let publisher = DownlinkPublisher::new("myapp@ttn", QoS::AtMostOnce);
        assert_eq!(publisher.send(&session, &command()).await, PublishOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_send_reports_local_rejection() {
        let mut mock = MockBusClient::new();
        mock.expect_publish()
            .times(1)
            .returning(|_, _, _| Err(BridgeError::Connection("request channel closed".to_string())));

        let session = Session::new(Arc::new(mock), Vec::new());
        let publisher = DownlinkPublisher::new("myapp@ttn", QoS::AtMostOnce);

        let outcome = publisher.send(&session, &command()).await;
        assert!(matches!(outcome, PublishOutcome::Rejected(reason) if reason.contains("request channel closed")));
    }
}
