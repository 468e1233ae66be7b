//! Definición del Contexto de Aplicación (Shared State).
//!
//! El `AppContext` agrupa los recursos de solo lectura que comparten las tareas
//! concurrentes del puente. Hoy es la configuración validada al arrancar.


use std::sync::Arc;
use crate::system::domain::System;


#[derive(Clone, Debug)]
pub struct AppContext {
    pub system: Arc<System>,
}


impl AppContext {
    pub fn new(system: System) -> Self {
        Self { system: Arc::new(system) }
    }
}
