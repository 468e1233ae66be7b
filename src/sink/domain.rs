//! Estructuras de dominio para la persistencia de uplinks.
//!
//! Una partición es el archivo de texto de un día calendario. Este módulo decide
//! qué partición corresponde a cada escritura y cómo se serializa una fila.


use std::fmt::Display;
use std::path::{Path, PathBuf};
use chrono::{Local, NaiveDate, Utc};
use chrono_tz::Tz;
use crate::config::sink::{ABSENT_MARKER, HEADER, PARTITION_EXTENSION, PARTITION_FORMAT, SEPARATOR};
use crate::uplink::domain::UplinkRecord;


/// Reloj con el que se calcula la fecha de la partición.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PartitionClock {
    Local,
    Zone(Tz),
}


impl PartitionClock {
    pub fn from_timezone(timezone: Option<Tz>) -> Self {
        timezone.map_or(PartitionClock::Local, PartitionClock::Zone)
    }

    pub fn today(&self) -> NaiveDate {
        match self {
            PartitionClock::Local => Local::now().date_naive(),
            PartitionClock::Zone(tz) => Utc::now().with_timezone(tz).date_naive(),
        }
    }
}


/// Archivo diario del log, identificado por su fecha (`YYYYMMDD`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPartition {
    pub key: String,
    pub path: PathBuf,
}


impl LogPartition {
    pub fn for_date(dir: &Path, date: NaiveDate) -> Self {
        let key = date.format(PARTITION_FORMAT).to_string();
        let path = dir.join(format!("{key}.{PARTITION_EXTENSION}"));
        Self { key, path }
    }
}


/// Fila de encabezado, terminada en salto de línea.
pub fn header_row() -> String {
    let mut row = HEADER.join(SEPARATOR);
    row.push('\n');
    row
}


/// Serializa un registro en el orden fijo de columnas.
pub fn format_row(record: &UplinkRecord) -> String {
    let columns = [
        clean(&record.received_at),
        clean(&record.application_id),
        clean(&record.device_id),
        optional(&record.f_port),
        optional(&record.f_cnt),
        optional(&record.rssi),
        optional(&record.snr),
        optional(&record.data_rate_index),
        optional(&record.consumed_airtime),
        clean(&record.frm_payload),
        optional(&record.decoded_payload),
    ];

    let mut row = columns.join(SEPARATOR);
    row.push('\n');
    row
}


fn optional<T: Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => clean(&v.to_string()),
        None => ABSENT_MARKER.to_string(),
    }
}


// Una fila ocupa siempre una sola línea.
fn clean(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}
