use std::fmt;

/// Connection parameters for the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Namespace tag every generated client id starts with
    pub client_id_prefix: String,
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("client_id_prefix", &self.client_id_prefix)
            .finish()
    }
}

impl fmt::Display for BrokerConfig {
    /// Formats as "user@host:port", password excluded.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// The six topics an exploration listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub infrared: String,
    pub temperature: String,
    pub humidity: String,
    pub gas: String,
    /// Raw camera stream published by the robot
    pub stream_send: String,
    /// Annotated stream coming back from the detection service
    pub stream_receive: String,
}

impl TopicSet {
    /// All topics in subscription order.
    pub fn all(&self) -> [&str; 6] {
        [
            &self.infrared,
            &self.temperature,
            &self.humidity,
            &self.gas,
            &self.stream_send,
            &self.stream_receive,
        ]
    }

    pub fn first_duplicate(&self) -> Option<&str> {
        let all = self.all();
        all.iter()
            .enumerate()
            .find(|(idx, topic)| all[..*idx].contains(topic))
            .map(|(_, topic)| *topic)
    }
}

/// Outbound control channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTopics {
    pub robot_control: String,
    pub stream_control: String,
}
