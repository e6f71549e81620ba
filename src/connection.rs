// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shared Transport Connection
//!
//! One connection per factory, created lazily on the first channel request
//! under double-checked initialization, and closed exactly once. When the
//! connection is lost and recovery is enabled, the next request re-establishes
//! it; concurrent callers wait for the same reconnect instead of racing.

use crate::{
    config::BrokerFactoryConfig,
    errors::BrokerError,
    transport::{Transport, TransportChannel, TransportConnection},
};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use tokio::{
    sync::{Mutex, RwLock},
    time::Instant,
};
use tracing::{debug, error, info, warn};

pub struct SharedConnection {
    transport: Arc<dyn Transport>,
    config: BrokerFactoryConfig,
    current: RwLock<Option<Arc<dyn TransportConnection>>>,
    init: Mutex<Option<Instant>>,
    recoveries: AtomicUsize,
    closed: AtomicBool,
}

impl SharedConnection {
    pub fn new(transport: Arc<dyn Transport>, config: BrokerFactoryConfig) -> Self {
        Self {
            transport,
            config,
            current: RwLock::new(None),
            init: Mutex::new(None),
            recoveries: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the live connection, creating or recovering it when needed.
    pub async fn get(&self) -> Result<Arc<dyn TransportConnection>, BrokerError> {
        self.ensure_open()?;

        if let Some(conn) = self.current.read().await.as_ref() {
            if conn.is_connected() {
                return Ok(conn.clone());
            }
        }

        // Last connect attempt, used to pace recovery.
        let mut last_attempt = self.init.lock().await;
        self.ensure_open()?;

        let existing = self.current.read().await.clone();
        if let Some(conn) = &existing {
            if conn.is_connected() {
                return Ok(conn.clone());
            }

            let Some(interval) = self.config.recovery_interval() else {
                error!("connection is lost and recovery is disabled");
                return Err(BrokerError::BrokerUnavailable(
                    "connection is lost and recovery is disabled".into(),
                ));
            };

            warn!("connection is lost, recovering...");
            if let Some(at) = *last_attempt {
                let elapsed = at.elapsed();
                if elapsed < interval {
                    tokio::time::sleep(interval - elapsed).await;
                }
            }
        }

        *last_attempt = Some(Instant::now());
        debug!("creating connection...");
        let conn = self.transport.connect(&self.config).await.map_err(|err| {
            error!(error = %err, "failure to connect");
            match err {
                BrokerError::BrokerUnavailable(_) => err,
                other => BrokerError::BrokerUnavailable(other.to_string()),
            }
        })?;

        if existing.is_some() {
            self.recoveries.fetch_add(1, Ordering::Relaxed);
            info!("connection recovered");
        } else {
            debug!("connection created");
        }

        *self.current.write().await = Some(conn.clone());
        Ok(conn)
    }

    /// Opens a channel over the shared connection.
    pub async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, BrokerError> {
        let conn = self.get().await?;
        conn.open_channel().await.map_err(|err| {
            error!(error = %err, "failure to create a channel");
            match err {
                BrokerError::BrokerUnavailable(_) => err,
                other => BrokerError::BrokerUnavailable(other.to_string()),
            }
        })
    }

    /// Closes the connection; later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _guard = self.init.lock().await;
        if let Some(conn) = self.current.write().await.take() {
            match conn.close().await {
                Ok(()) => debug!("connection closed"),
                Err(err) => warn!(error = %err, "failure to close the connection"),
            }
        }
    }

    pub fn is_created(&self) -> bool {
        self.current
            .try_read()
            .map(|conn| conn.is_some())
            .unwrap_or(true)
    }

    pub fn recoveries(&self) -> usize {
        self.recoveries.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Disposed("connection".into()));
        }
        Ok(())
    }
}
