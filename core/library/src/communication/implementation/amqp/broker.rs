use super::AmqpChannel;
use crate::communication::broker::Broker;
use crate::communication::rpc::Settings;
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use lapin::options::ConfirmSelectOptions;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{Connection, ConnectionProperties};
use tracing::{debug, info, instrument};

/// Connection to an AMQP broker
pub struct AmqpBroker {
    connection: Connection,
}

impl AmqpBroker {
    /// Connects to the broker described by the settings, naming the connection after the application
    #[instrument(skip(settings), fields(host = %settings.amq_host, port = settings.amq_port, vhost = %settings.amq_virtualhost))]
    pub async fn connect(settings: &Settings) -> Result<Self, BoxedError> {
        let properties =
            ConnectionProperties::default().with_connection_name(settings.app_name.clone().into());

        let connection = Connection::connect_uri(uri(settings), properties).await?;
        info!("Connected to broker");

        Ok(Self { connection })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> Result<Self::Channel, BoxedError> {
        let channel = self.connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        debug!(id = channel.id(), "Opened channel");
        Ok(AmqpChannel::new(channel))
    }

    async fn close(&self) -> EmptyResult {
        if self.connection.status().connected() {
            self.connection.close(200, "Bye").await?;
            debug!("Closed connection");
        }

        Ok(())
    }
}

/// Location of the broker described by the settings
pub(super) fn uri(settings: &Settings) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: settings.amq_user.clone(),
                password: settings.amq_password.clone(),
            },
            host: settings.amq_host.clone(),
            port: settings.amq_port,
        },
        vhost: settings.amq_virtualhost.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn build_uri_from_settings() {
        let mut settings = Settings::new("app", "rabbit.local");
        settings.amq_port = 5673;
        settings.amq_user = "user".into();
        settings.amq_password = "secret".into();
        settings.amq_virtualhost = "staging".into();

        let uri = uri(&settings);

        assert_eq!(uri.authority.host, "rabbit.local");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "user");
        assert_eq!(uri.authority.userinfo.password, "secret");
        assert_eq!(uri.vhost, "staging");
    }
}
