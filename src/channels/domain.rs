use tokio::sync::mpsc;
use crate::config::sink::CHANNEL_CAPACITY;
use crate::uplink::domain::{InboundMessage, UplinkRecord};


pub struct Channels {
    pub session_to_uplink: mpsc::Sender<InboundMessage>,
    pub uplink_from_session: mpsc::Receiver<InboundMessage>,

    pub uplink_to_sink: mpsc::Sender<UplinkRecord>,
    pub sink_from_uplink: mpsc::Receiver<UplinkRecord>,
}


impl Channels {
    pub fn new() -> Channels {
        let (s_to_u, u_from_s) = mpsc::channel::<InboundMessage>(CHANNEL_CAPACITY);
        let (u_to_sink, sink_from_u) = mpsc::channel::<UplinkRecord>(CHANNEL_CAPACITY);

        Self {
            session_to_uplink: s_to_u,
            uplink_from_session: u_from_s,
            uplink_to_sink: u_to_sink,
            sink_from_uplink: sink_from_u,
        }
    }
}
