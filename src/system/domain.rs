//! Módulo de configuración central y gestión del entorno de ejecución.
//!
//! Este módulo actúa como la fuente única de verdad para la configuración del puente.
//! Se encarga de leer las variables de entorno, establecer valores por defecto
//! y validar una sola vez, al arrancar, la identidad de conexión y el direccionamiento
//! de tópicos que usarán la sesión MQTT y el registro diario.
//!
//! # Funcionalidades Principales
//! * **Carga de Configuración:** Lee de `.env` en desarrollo y variables de sistema en producción.
//! * **Observabilidad:** Configura `tracing_subscriber` para logs estructurados o legibles.
//! * **Errores:** Define la taxonomía `BridgeError` compartida por todos los módulos.
//!


use std::env;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use chrono_tz::Tz;
use rumqttc::QoS;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter};
use crate::config::mqtt::MIN_KEEP_ALIVE_SECS;


/// Representa la configuración global del sistema y el estado del entorno.
///
/// Agrupa la identidad de conexión (usuario, API key, host, puerto, keep-alive),
/// el direccionamiento de tópicos y la ubicación del registro diario.
/// Se comparte como `Arc<System>` y no cambia durante la vida del proceso.
#[derive(Clone)]
pub struct System {
    /// Usuario MQTT de la aplicación en The Things Stack (ej. `mi-app@ttn`).
    /// **Requerido** (`TTN_USER`).
    pub principal: String,

    /// API key usada como contraseña MQTT. Nunca se imprime.
    /// **Requerido** (`TTN_API_KEY`).
    secret: String,

    /// Host TLS público del servidor de red.
    /// Por defecto: `au1.cloud.thethings.network`.
    pub host: String,

    /// Puerto TLS del broker.
    /// Por defecto: `8883`.
    pub port: u16,

    /// Intervalo de keep-alive MQTT en segundos.
    /// Por defecto: `60`.
    pub keep_alive_secs: u64,

    /// Bundle PEM de autoridades propias. Si no existe se usa el almacén del sistema.
    pub ca_cert_path: Option<PathBuf>,

    /// Dispositivo concreto para uplinks y destino por defecto de downlinks.
    pub device_id: Option<String>,

    /// Suscribirse a todos los tópicos visibles para el usuario.
    /// Por defecto: `true`.
    pub all_devices: bool,

    /// QoS usado en la suscripción de uplinks y en la publicación de downlinks.
    /// Por defecto: `0`.
    pub qos: QoS,

    /// Directorio donde se crean las particiones diarias.
    /// Por defecto: `.`.
    pub log_dir: PathBuf,

    /// Zona horaria para decidir la partición. `None` usa el reloj local.
    pub log_timezone: Option<Tz>,

    /// Entorno de ejecución actual (`development`, `staging`, `production`).
    /// Afecta el formato de logs y la carga de archivos `.env`.
    pub environment: String,

    /// Nivel de detalle de los logs (ej. `info`, `debug`, `warn`).
    /// Se autoconfigura según el `environment` si no se especifica.
    pub rust_log: String,
}


impl System {

    /// Carga la configuración desde las variables de entorno.
    ///
    /// # Comportamiento
    /// * Si `ENVIRONMENT` es "development", intenta cargar un archivo `.env`.
    /// * Las variables ausentes toman su valor por defecto.
    ///
    /// # Errores
    /// * `BridgeError::Config` si falta una variable requerida o un valor no es válido.
    pub fn new() -> Result<Self, BridgeError> {

        let environment = env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "development".into());

        if environment == "development" {
            dotenv::dotenv().ok();
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Construye y valida la configuración a partir de una función de búsqueda de claves.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BridgeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| BridgeError::Config(format!("{key} no está configurada")))
        };

        let environment = lookup("ENVIRONMENT").unwrap_or_else(|| "development".into());

        let principal = required("TTN_USER")?;
        let secret = required("TTN_API_KEY")?;

        let host = lookup("TTN_HOST")
            .unwrap_or_else(|| "au1.cloud.thethings.network".to_string());

        let port: u16 = parse_number(&lookup, "TTN_PORT", 8883)?;

        let keep_alive_secs: u64 = parse_number(&lookup, "TTN_KEEP_ALIVE_SECS", 60)?;
        if keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(BridgeError::Config(format!(
                "TTN_KEEP_ALIVE_SECS debe ser al menos {MIN_KEEP_ALIVE_SECS}"
            )));
        }

        let device_id = lookup("TTN_DEVICE_ID").filter(|id| !id.trim().is_empty());

        let all_devices = match lookup("TTN_ALL_DEVICES") {
            Some(value) => parse_bool("TTN_ALL_DEVICES", &value)?,
            None => true,
        };

        if !all_devices && device_id.is_none() {
            return Err(BridgeError::Config(
                "no se puede suscribir a ningún tópico: TTN_ALL_DEVICES=false y TTN_DEVICE_ID vacío".to_string(),
            ));
        }

        let qos = parse_qos(&lookup("TTN_QOS").unwrap_or_else(|| "0".to_string()))?;

        let log_timezone = match lookup("LOG_TIMEZONE") {
            Some(name) => Some(name.parse::<Tz>().map_err(|_| {
                BridgeError::Config(format!("LOG_TIMEZONE inválida: {name}"))
            })?),
            None => None,
        };

        let rust_log = lookup("RUST_LOG").unwrap_or_else(|| {
            match environment.as_str() {
                "development" => "debug".to_string(),
                "staging" => "info".to_string(),
                _ => "warn".to_string(),
            }
        });

        Ok(System {
            principal,
            secret,
            host,
            port,
            keep_alive_secs,
            ca_cert_path: lookup("TTN_CA_CERT_PATH").map(PathBuf::from),
            device_id,
            all_devices,
            qos,
            log_dir: lookup("LOG_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            log_timezone,
            environment,
            rust_log,
        })
    }

    /// Contraseña MQTT. Solo la sesión la consume al construir las opciones del cliente.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}


impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("ca_cert_path", &self.ca_cert_path)
            .field("device_id", &self.device_id)
            .field("all_devices", &self.all_devices)
            .field("qos", &self.qos)
            .field("log_dir", &self.log_dir)
            .field("log_timezone", &self.log_timezone)
            .field("environment", &self.environment)
            .field("rust_log", &self.rust_log)
            .finish()
    }
}


fn parse_number<F, T>(lookup: &F, key: &str, default: T) -> Result<T, BridgeError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| BridgeError::Config(format!("{key} debe ser un número"))),
        None => Ok(default),
    }
}


fn parse_bool(key: &str, value: &str) -> Result<bool, BridgeError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(BridgeError::Config(format!("{key} debe ser true o false"))),
    }
}


/// Traduce el nivel numérico de QoS (0, 1 o 2) al tipo del cliente MQTT.
pub fn parse_qos(value: &str) -> Result<QoS, BridgeError> {
    match value.trim() {
        "0" => Ok(QoS::AtMostOnce),
        "1" => Ok(QoS::AtLeastOnce),
        "2" => Ok(QoS::ExactlyOnce),
        other => Err(BridgeError::Config(format!("TTN_QOS debe ser 0, 1 o 2, no {other}"))),
    }
}


pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}


/// Categorización de errores operativos del sistema.
///
/// Ningún mensaje incluye la API key.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuración inválida: {0}")]
    Config(String),

    #[error("error de conexión: {0}")]
    Connection(String),

    #[error("autenticación rechazada por el broker: {0}")]
    Authentication(String),

    #[error("suscripción rechazada para el tópico '{topic}': {reason}")]
    Subscription { topic: String, reason: String },

    #[error("mensaje malformado: {0}")]
    MalformedMessage(String),

    #[error("error de E/S en {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}


impl BridgeError {

    /// Código de salida del proceso asociado a este error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            BridgeError::Config(_) => ExitCode::from(2),
            _ => ExitCode::from(1),
        }
    }
}


/// Inicializa el sistema de trazabilidad y logs (Tracing).
///
/// Configura el formato de salida basándose en el entorno:
/// * **Production**: Salida JSON (para logs estructurados en la nube).
/// * **Development/Otros**: Salida "Pretty" (colores y formato legible).
pub fn init_tracing(system: &System) {

    let filter = EnvFilter::try_new(&system.rust_log)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = subscriber_fmt().with_env_filter(filter).with_target(false);

    if system.environment == "production" {
        builder.json().init();
    } else {
        builder.pretty().init();
    }

    info!(
        principal = %system.principal,
        host = %system.host,
        port = system.port,
        environment = %system.environment,
        "Info: configuración cargada"
    );
}
