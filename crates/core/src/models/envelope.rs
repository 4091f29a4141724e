use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 在消息队列中传递的消息信封
///
/// `body` 对所有核心组件都是不透明的，只有发布端的序列化和注册的处理器会解释它。
/// 字段名是键值存储后端的持久化契约，序列化时必须保持不变。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
    #[serde(rename = "TaskName")]
    pub task_name: String,
    pub timestamp: DateTime<Utc>,
    /// 后端回执（例如AMQP delivery tag），只在消费端存在，不参与序列化
    #[serde(skip)]
    pub receipt: Option<u64>,
}

impl Envelope {
    pub fn new(task_name: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_id: Uuid::new_v4().to_string(),
            body,
            task_name: task_name.into(),
            timestamp: Utc::now(),
            receipt: None,
        }
    }

    pub fn with_receipt(mut self, receipt: u64) -> Self {
        self.receipt = Some(receipt);
        self
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// 字节数组以base64字符串形式出现在JSON中
mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
