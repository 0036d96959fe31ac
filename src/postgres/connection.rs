use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{error, info};

use crate::config::SslMode;
use crate::{Error, Result};

/// An open client plus the task driving its socket.
///
/// Dropping it aborts the connection task, which closes the session.
pub struct PgConnection {
    client: Client,
    connection_task: JoinHandle<()>,
}

impl PgConnection {
    pub async fn connect(
        connection_string: &str,
        ssl_mode: &SslMode,
        connect_timeout: Duration,
        label: &'static str,
    ) -> Result<Self> {
        if *ssl_mode == SslMode::Require {
            return Err(Error::Config(format!(
                "{} connection requires TLS, which this build does not provide",
                label
            )));
        }

        let mut config = connection_string.parse::<Config>()?;
        config.connect_timeout(connect_timeout);
        config.application_name("pg-sql-replay");

        let (client, connection) = config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("{} connection error: {}", label, e);
            }
        });

        info!("Connected to PostgreSQL ({})", label);
        Ok(Self {
            client,
            connection_task,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}
