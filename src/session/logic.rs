//! Gestor de la sesión MQTT.
//!
//! Mantiene la única conexión del proceso con el broker de The Things Stack.
//!
//! # Ciclo de vida
//! `Disconnected → Connecting → Connected → Subscribed → Running`.
//! Ante una pérdida de red vuelve a `Connecting` conservando la lista de
//! suscripciones, que se reemite completa en el siguiente CONNACK antes de
//! procesar cualquier otro evento. Una parada explícita pasa por `ShuttingDown`.


use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, QoS, SubscribeReasonCode, Transport};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use crate::config::mqtt::{CLIENT_ID_PREFIX, DISCONNECT_TIMEOUT, LOOP_TICK, RECONNECT_DELAY, REQUEST_CAPACITY};
use crate::context::domain::AppContext;
use crate::system::domain::{qos_level, BridgeError, System};
use crate::uplink::domain::InboundMessage;
use super::domain::{refused_error, translate, BusClient, DeviceSelector, PublishOutcome, SessionEvent, SessionState, Subscription, TopicAddress};


#[async_trait]
impl BusClient for AsyncClient {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BridgeError> {
        AsyncClient::subscribe(self, topic, qos)
            .await
            .map_err(|e| BridgeError::Subscription { topic: topic.to_string(), reason: e.to_string() })
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), BridgeError> {
        AsyncClient::publish(self, topic, qos, false, payload)
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        AsyncClient::disconnect(self)
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()))
    }
}


/// Estado explícito de la sesión, propiedad del bucle de despacho.
pub struct Session {
    client: Arc<dyn BusClient>,
    subscriptions: Vec<Subscription>,
    pending_acks: VecDeque<String>,
    state: SessionState,
    has_connected: bool,
    received: u64,
}


impl Session {
    pub fn new(client: Arc<dyn BusClient>, subscriptions: Vec<Subscription>) -> Self {
        Self {
            client,
            subscriptions,
            pending_acks: VecDeque::new(),
            state: SessionState::Disconnected,
            has_connected: false,
            received: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Marca el inicio del intento de conexión; el CONNECT lo envía el event loop.
    pub fn begin_connect(&mut self) {
        self.state = SessionState::Connecting;
    }

    /// Agrega una suscripción. Si hay conexión se emite de inmediato.
    pub async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), BridgeError> {
        self.subscriptions.push(Subscription { topic: topic.to_string(), qos });

        if matches!(self.state, SessionState::Connected | SessionState::Subscribed | SessionState::Running) {
            self.client.subscribe(topic, qos).await?;
            self.pending_acks.push_back(topic.to_string());
            self.state = SessionState::Subscribed;
        }
        Ok(())
    }

    /// Publicación de mejor esfuerzo: solo informa si el cliente local aceptó el envío.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> PublishOutcome {
        match self.client.publish(topic, qos, payload).await {
            Ok(()) => PublishOutcome::Accepted,
            Err(e) => PublishOutcome::Rejected(e.to_string()),
        }
    }

    /// Procesa un evento del bus.
    ///
    /// # Retorno
    /// * `Ok(Some(msg))`: mensaje entrante a entregar al normalizador.
    /// * `Ok(None)`: evento de ciclo de vida ya atendido.
    /// * `Err(_)`: error fatal (autenticación o conexión).
    pub async fn handle_event(&mut self, event: SessionEvent) -> Result<Option<InboundMessage>, BridgeError> {
        match event {
            SessionEvent::ConnAck(ConnectReturnCode::Success) => {
                info!(reconnect = self.has_connected, "Info: conectado al broker MQTT");
                self.has_connected = true;
                self.state = SessionState::Connected;
                self.resubscribe().await;
                Ok(None)
            }
            SessionEvent::ConnAck(code) => {
                let e = refused_error(code);
                if self.has_connected && !matches!(e, BridgeError::Authentication(_)) {
                    warn!(code = ?code, "Warning: reconexión rechazada por el broker, reintentando");
                    self.pending_acks.clear();
                    self.state = SessionState::Connecting;
                    return Ok(None);
                }
                error!(code = ?code, "Error: conexión rechazada por el broker");
                self.state = SessionState::Disconnected;
                Err(e)
            }
            SessionEvent::SubAck(codes) => {
                for code in codes {
                    let topic = self.pending_acks.pop_front().unwrap_or_default();
                    match code {
                        SubscribeReasonCode::Success(granted) => {
                            info!(topic = %topic, qos = qos_level(granted), "Info: suscripción confirmada");
                        }
                        SubscribeReasonCode::Failure => {
                            let e = BridgeError::Subscription { topic, reason: "SUBACK con fallo".to_string() };
                            warn!("Warning: {e}");
                        }
                    }
                }
                if self.pending_acks.is_empty() && self.state == SessionState::Subscribed {
                    self.state = SessionState::Running;
                }
                Ok(None)
            }
            SessionEvent::Message { topic, qos, payload } => {
                if self.state == SessionState::ShuttingDown {
                    return Ok(None);
                }
                self.received += 1;
                debug!(topic = %topic, qos = qos_level(qos), "Debug: mensaje recibido");
                Ok(Some(InboundMessage { topic, payload }))
            }
            SessionEvent::ConnectionLost(reason) => {
                if self.state == SessionState::ShuttingDown {
                    self.state = SessionState::Disconnected;
                    return Ok(None);
                }
                if !self.has_connected {
                    error!(reason = %reason, "Error: no se pudo conectar al broker");
                    self.state = SessionState::Disconnected;
                    return Err(BridgeError::Connection(reason));
                }
                warn!(reason = %reason, "Warning: conexión perdida, reconectando");
                self.pending_acks.clear();
                self.state = SessionState::Connecting;
                Ok(None)
            }
        }
    }

    async fn resubscribe(&mut self) {
        self.pending_acks.clear();

        for subscription in &self.subscriptions {
            match self.client.subscribe(&subscription.topic, subscription.qos).await {
                Ok(()) => {
                    info!(topic = %subscription.topic, qos = qos_level(subscription.qos), "Info: suscribiendo");
                    self.pending_acks.push_back(subscription.topic.clone());
                }
                Err(e) => warn!("Warning: {e}"),
            }
        }

        self.state = if self.pending_acks.is_empty() {
            SessionState::Running
        } else {
            SessionState::Subscribed
        };
    }

    /// Inicia el cierre limpio.
    ///
    /// Retorna `true` si se envió un DISCONNECT que el event loop debe terminar de escribir.
    pub async fn disconnect(&mut self) -> bool {
        let live = matches!(
            self.state,
            SessionState::Connected | SessionState::Subscribed | SessionState::Running
        );
        self.state = SessionState::ShuttingDown;

        if !live {
            self.state = SessionState::Disconnected;
            return false;
        }

        match self.client.disconnect().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Warning: no se pudo enviar DISCONNECT. {e}");
                self.state = SessionState::Disconnected;
                false
            }
        }
    }

    pub fn finish(&mut self) {
        self.state = SessionState::Disconnected;
        info!(received = self.received, "Info: sesión cerrada");
    }
}


/// Suscripciones de uplink derivadas de la configuración.
pub fn uplink_subscriptions(system: &System) -> Vec<Subscription> {
    let selector = match (&system.device_id, system.all_devices) {
        (Some(device_id), false) => DeviceSelector::Device(device_id.clone()),
        _ => DeviceSelector::All,
    };

    vec![Subscription {
        topic: TopicAddress::uplink(&system.principal, selector).to_string(),
        qos: system.qos,
    }]
}


fn build_transport(system: &System) -> Result<Transport, BridgeError> {
    match &system.ca_cert_path {
        Some(path) => {
            let ca = std::fs::read(path).map_err(|e| {
                BridgeError::Config(format!("no se pudo leer TTN_CA_CERT_PATH {}: {e}", path.display()))
            })?;
            Ok(Transport::tls(ca, None, None))
        }
        None => Ok(Transport::tls_with_default_config()),
    }
}


/// Crea el cliente MQTT autenticado sobre TLS. La conexión se abre en el primer `poll`.
pub fn create_client(system: &System) -> Result<(AsyncClient, EventLoop), BridgeError> {
    let client_id = format!("{CLIENT_ID_PREFIX}-{}", std::process::id());

    let mut options = MqttOptions::new(client_id, system.host.as_str(), system.port);
    options
        .set_keep_alive(Duration::from_secs(system.keep_alive_secs))
        .set_credentials(system.principal.as_str(), system.secret())
        .set_clean_session(true)
        .set_transport(build_transport(system)?);

    Ok(AsyncClient::new(options, REQUEST_CAPACITY))
}


/// Termina de escribir el DISCONNECT pendiente, con tiempo acotado.
pub async fn drain_disconnect(eventloop: &mut EventLoop) {
    let drained = timeout(DISCONNECT_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!("Warning: DISCONNECT no confirmado dentro del tiempo límite");
    }
}


/// Ejecuta la sesión hasta la parada del operador o un error fatal.
///
/// Los mensajes entrantes se entregan por `tx` en el mismo orden en que llegan.
#[instrument(
    name = "run_session_task",
    skip_all,
    fields(host = %app_context.system.host, port = app_context.system.port)
)]
pub async fn run_session(tx: mpsc::Sender<InboundMessage>,
                         app_context: AppContext,
                         shutdown: CancellationToken) -> Result<(), BridgeError> {

    let system = &app_context.system;
    let (client, mut eventloop) = create_client(system)?;
    let mut session = Session::new(Arc::new(client), Vec::new());

    session.begin_connect();
    for subscription in uplink_subscriptions(system) {
        session.subscribe(&subscription.topic, subscription.qos).await?;
    }

    info!(
        topics = session.subscriptions().len(),
        "Info: conectando al broker {}:{}", system.host, system.port
    );

    let mut tick = interval(LOOP_TICK);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Info: parada solicitada, desconectando");
                if session.disconnect().await {
                    drain_disconnect(&mut eventloop).await;
                }
                session.finish();
                return Ok(());
            }

            polled = eventloop.poll() => {
                let Some(event) = translate(polled)? else {
                    continue;
                };
                let retry = match &event {
                    SessionEvent::ConnectionLost(_) => true,
                    SessionEvent::ConnAck(code) => *code != ConnectReturnCode::Success,
                    _ => false,
                };

                if let Some(msg) = session.handle_event(event).await? {
                    if tx.send(msg).await.is_err() {
                        error!("Error: no se pudo enviar el mensaje a uplink_task");
                    }
                }

                if retry {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = sleep(RECONNECT_DELAY) => {}
                    }
                }
            }

            _ = tick.tick() => {
                debug!(state = ?session.state(), received = session.received(), "Debug: sesión activa");
            }
        }
    }
}
