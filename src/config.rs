//! Configuration module for the consumer service
//!
//! This module handles loading and validating configuration from environment
//! variables, providing strongly-typed configuration structures for the
//! service and its Kafka components.

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{Error, Result};
use crate::kafka::KafkaConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct Config {
    /// Service configuration
    #[serde(flatten)]
    #[envconfig(nested = true)]
    pub service: ServiceConfig,

    /// Kafka configuration
    #[serde(flatten)]
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    /// Metrics configuration
    #[serde(flatten)]
    #[envconfig(nested = true)]
    pub metrics: MetricsConfig,
}

/// Service configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct ServiceConfig {
    /// Component name used in logs and metric labels
    #[envconfig(from = "COMPONENT_NAME", default = "events-consumer")]
    pub component_name: String,

    /// Log level
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// Environment (development, staging, production)
    #[envconfig(from = "ENVIRONMENT", default = "development")]
    pub environment: String,
}

impl ServiceConfig {
    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// Check if running in production mode
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    #[envconfig(from = "METRICS_ENABLED", default = "true")]
    pub enabled: bool,

    /// Address the exporter binds to
    #[envconfig(from = "METRICS_HOST", default = "0.0.0.0")]
    pub host: String,

    /// Metrics port
    #[envconfig(from = "METRICS_PORT", default = "9090")]
    pub port: u16,
}

impl MetricsConfig {
    /// Exporter listen address
    pub fn address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::config(format!("invalid metrics address: {}", e)))
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenv::dotenv().ok();

        Config::init_from_env().map_err(Error::from)
    }

    /// Validate settings the component builders do not cover
    pub fn validate(&self) -> Result<()> {
        if self.service.component_name.trim().is_empty() {
            return Err(Error::config("Component name cannot be empty"));
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(Error::config("Metrics port cannot be 0"));
            }
            self.metrics.address()?;
        }

        Ok(())
    }

    /// Log configuration
    pub fn log_config(&self) {
        tracing::info!(
            component = %self.service.component_name,
            environment = %self.service.environment,
            log_level = %self.service.log_level,
            "Service configuration"
        );

        tracing::info!(
            brokers = %self.kafka.brokers,
            group_id = %self.kafka.group_id,
            topics = %self.kafka.topics,
            batch_size = %self.kafka.batch_size,
            batch_timeout_ms = %self.kafka.batch_timeout_ms,
            retries = %self.kafka.retries,
            failure_strategy = %self.kafka.failure_strategy,
            "Kafka configuration"
        );

        tracing::info!(
            enabled = %self.metrics.enabled,
            port = %self.metrics.port,
            "Metrics configuration"
        );
    }
}
