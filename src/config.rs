pub mod mqtt {
    use tokio::time::{Duration};

    pub const CLIENT_ID_PREFIX: &str = "ttn-tab-bridge";
    pub const REQUEST_CAPACITY: usize = 10;
    pub const LOOP_TICK: Duration = Duration::from_secs(10);
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
    pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DOWNLINK_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MIN_KEEP_ALIVE_SECS: u64 = 5;
}

pub mod topic {
    pub const NAMESPACE: &str = "v3";
    pub const RESOURCE: &str = "devices";
    pub const UPLINK: &str = "up";
    pub const DOWNLINK_PUSH: &str = "down/push";
    pub const ALL_TOPICS: &str = "#";
}

pub mod sink {
    pub const CHANNEL_CAPACITY: usize = 200;
    pub const PARTITION_FORMAT: &str = "%Y%m%d";
    pub const PARTITION_EXTENSION: &str = "txt";
    pub const ABSENT_MARKER: &str = "-";
    pub const SEPARATOR: &str = "\t";
    pub const HEADER: [&str; 11] = [
        "received_at",
        "application_id",
        "device_id",
        "f_port",
        "f_cnt",
        "rssi",
        "snr",
        "data_rate_index",
        "consumed_airtime",
        "frm_payload",
        "decoded_payload",
    ];
}
