use std::path::PathBuf;
use chrono::NaiveDate;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};
use crate::context::domain::AppContext;
use crate::system::domain::{BridgeError, System};
use crate::uplink::domain::UplinkRecord;
use super::domain::{format_row, header_row, LogPartition, PartitionClock};


/// Escritor del log diario de uplinks.
#[derive(Debug, Clone)]
pub struct UplinkSink {
    dir: PathBuf,
    clock: PartitionClock,
}


impl UplinkSink {
    pub fn new(dir: PathBuf, clock: PartitionClock) -> Self {
        Self { dir, clock }
    }

    pub fn from_system(system: &System) -> Self {
        Self::new(system.log_dir.clone(), PartitionClock::from_timezone(system.log_timezone))
    }

    /// Crea el directorio del log si no existe.
    pub async fn prepare(&self) -> Result<(), BridgeError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| BridgeError::Io { path: self.dir.clone(), source })
    }

    /// Agrega el registro a la partición del día actual.
    pub async fn write(&self, record: &UplinkRecord) -> Result<PathBuf, BridgeError> {
        self.write_on(record, self.clock.today()).await
    }

    /// Agrega el registro a la partición de `date`.
    ///
    /// Si la partición está vacía, el encabezado y la fila salen en la misma escritura.
    /// El archivo se vacía y se cierra antes de retornar, también en los caminos de error.
    pub async fn write_on(&self, record: &UplinkRecord, date: NaiveDate) -> Result<PathBuf, BridgeError> {

        let partition = LogPartition::for_date(&self.dir, date);
        let io_err = |source: std::io::Error| BridgeError::Io { path: partition.path.clone(), source };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&partition.path)
            .await
            .map_err(io_err)?;

        let is_new = file.metadata().await.map_err(io_err)?.len() == 0;

        let mut buffer = String::new();
        if is_new {
            buffer.push_str(&header_row());
        }
        buffer.push_str(&format_row(record));

        file.write_all(buffer.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;

        if is_new {
            info!(partition = %partition.key, "Info: nueva partición creada");
        }

        Ok(partition.path)
    }
}


/// Consume registros y los escribe en orden de llegada.
///
/// Un fallo de escritura se reporta y el registro se descarta; la tarea continúa.
#[instrument(
    name = "run_sink_task",
    skip(rx, app_context)
)]
pub async fn sink_task(mut rx: mpsc::Receiver<UplinkRecord>,
                       app_context: AppContext) {

    let sink = UplinkSink::from_system(&app_context.system);

    if let Err(e) = sink.prepare().await {
        error!("Error: no se pudo preparar el directorio del log. {e}");
    }

    info!("Info: tarea sink creada");

    while let Some(record) = rx.recv().await {
        match sink.write(&record).await {
            Ok(path) => {
                debug!(device_id = %record.device_id, path = %path.display(), "Debug: uplink registrado");
            }
            Err(e) => {
                error!(device_id = %record.device_id, "Error: registro descartado. {e}");
            }
        }
    }

    info!("Info: tarea sink finalizada");
}


pub fn start_sink(rx_from_uplink: mpsc::Receiver<UplinkRecord>,
                  app_context: AppContext) -> JoinHandle<()> {

    tokio::spawn(async move {
        sink_task(rx_from_uplink,
                  app_context
        ).await;
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn record(device_id: &str, f_cnt: u32) -> UplinkRecord {
        UplinkRecord {
            received_at: "2024-01-01T10:00:00Z".to_string(),
            application_id: "myapp".to_string(),
            device_id: device_id.to_string(),
            f_port: Some(10),
            f_cnt: Some(f_cnt),
            rssi: Some(-80.0),
            snr: Some(7.2),
            data_rate_index: Some(2),
            consumed_airtime: None,
            frm_payload: "Zm9v".to_string(),
            decoded_payload: None,
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[tokio::test]
    async fn test_single_header_for_same_day() {
        let dir = TempDir::new().unwrap();
        let sink = UplinkSink::new(dir.path().to_path_buf(), PartitionClock::Local);

        let first = sink.write_on(&record("eui-AAA", 1), date(1)).await.unwrap();
        let second = sink.write_on(&record("eui-BBB", 2), date(1)).await.unwrap();
        assert_eq!(first, second);

        let content = std::fs::read_to_string(&first).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("received_at\tapplication_id"));
        assert_eq!(
            lines[1],
            "2024-01-01T10:00:00Z\tmyapp\teui-AAA\t10\t1\t-80\t7.2\t2\t-\tZm9v\t-"
        );
        assert!(lines[2].contains("\teui-BBB\t"));
        assert_eq!(content.matches("received_at").count(), 1);
    }

    #[tokio::test]
    async fn test_new_day_opens_new_partition() {
        let dir = TempDir::new().unwrap();
        let sink = UplinkSink::new(dir.path().to_path_buf(), PartitionClock::Local);

        let day_one = sink.write_on(&record("eui-AAA", 1), date(1)).await.unwrap();
        let day_two = sink.write_on(&record("eui-AAA", 2), date(2)).await.unwrap();

        assert!(day_one.ends_with("20240101.txt"));
        assert!(day_two.ends_with("20240102.txt"));

        let content = std::fs::read_to_string(&day_two).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.starts_with("received_at"));
    }

    #[tokio::test]
    async fn test_unwritable_dir_reports_io_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let sink = UplinkSink::new(blocker, PartitionClock::Local);

        let result = sink.write_on(&record("eui-AAA", 1), date(1)).await;
        assert!(matches!(result, Err(BridgeError::Io { .. })));
    }

    #[tokio::test]
    async fn test_write_uses_clock_partition() {
        let dir = TempDir::new().unwrap();
        let sink = UplinkSink::new(dir.path().to_path_buf(), PartitionClock::Zone(chrono_tz::UTC));

        let path = sink.write(&record("eui-AAA", 1)).await.unwrap();
        let expected = LogPartition::for_date(dir.path(), PartitionClock::Zone(chrono_tz::UTC).today());
        assert_eq!(path, expected.path);
    }

    #[tokio::test]
    async fn test_task_drops_failed_record_and_continues() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().to_str().unwrap().to_string();
        let system = System::from_lookup(|key| match key {
            "TTN_USER" => Some("myapp@ttn".to_string()),
            "TTN_API_KEY" => Some("NNSXS.SECRET".to_string()),
            "ENVIRONMENT" => Some("test".to_string()),
            "LOG_DIR" => Some(log_dir.clone()),
            "LOG_TIMEZONE" => Some("UTC".to_string()),
            _ => None,
        })
        .unwrap();
        let app_context = AppContext { system: Arc::new(system) };

        // Un directorio con el nombre de la partición hace fallar la apertura.
        let partition = LogPartition::for_date(dir.path(), PartitionClock::Zone(chrono_tz::UTC).today());
        std::fs::create_dir(&partition.path).unwrap();

        let (tx, rx) = mpsc::channel(10);
        let handle = start_sink(rx, app_context);

        tx.send(record("eui-AAA", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(partition.path.is_dir());

        std::fs::remove_dir(&partition.path).unwrap();
        tx.send(record("eui-BBB", 2)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let content = std::fs::read_to_string(&partition.path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("received_at"));
        assert!(lines[1].contains("\teui-BBB\t"));
        assert!(!content.contains("eui-AAA"));
    }
}
