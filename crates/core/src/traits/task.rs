use async_trait::async_trait;
use serde::Serialize;

use crate::CabbageResult;

/// 消费端能力：根据消息体和消息ID处理一条任务
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, body: &[u8], id: &str) -> CabbageResult<()>;
}

/// 发布端能力：把自身序列化成消息体
pub trait TaskPublisher: Send + Sync {
    fn to_publish(&self) -> CabbageResult<Vec<u8>>;
}

impl TaskPublisher for Vec<u8> {
    fn to_publish(&self) -> CabbageResult<Vec<u8>> {
        Ok(self.clone())
    }
}

impl TaskPublisher for String {
    fn to_publish(&self) -> CabbageResult<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }
}

/// 以JSON形式发布任意可序列化的值
#[derive(Debug, Clone)]
pub struct JsonPayload<T>(pub T);

impl<T: Serialize + Send + Sync> TaskPublisher for JsonPayload<T> {
    fn to_publish(&self) -> CabbageResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Report {
        id: String,
        site_id: String,
    }

    #[test]
    fn test_json_payload() {
        let payload = JsonPayload(Report {
            id: "hsfhsjghjs".to_string(),
            site_id: "mnbghs".to_string(),
        });
        let body = payload.to_publish().unwrap();
        assert_eq!(body, br#"{"id":"hsfhsjghjs","site_id":"mnbghs"}"#.to_vec());
    }

    #[test]
    fn test_raw_payloads() {
        assert_eq!(vec![1u8, 2].to_publish().unwrap(), vec![1, 2]);
        assert_eq!("abc".to_string().to_publish().unwrap(), b"abc".to_vec());
    }
}
