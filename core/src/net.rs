use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, RANGE};

use crate::error::{CoreError, CoreResult};

pub const HTTP_RANGE_NOT_SATISFIABLE: u16 = 416;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub range: Option<(u64, Option<u64>)>,
    pub basic_auth: Option<(String, String)>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            range: None,
            basic_auth: None,
        }
    }

    pub fn with_range(mut self, start: u64, end: Option<u64>) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn with_basic_auth(mut self, user: String, password: String) -> Self {
        self.basic_auth = Some((user, password));
        self
    }

    fn range_header(&self) -> Option<String> {
        self.range.map(|(start, end)| match end {
            Some(end) => format!("bytes={}-{}", start, end),
            None => format!("bytes={}-", start),
        })
    }
}

/// What a HEAD request tells us about the resource.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status_code: u16,
    pub total_bytes: Option<u64>,
    pub accept_ranges: bool,
}

/// A streaming response body. Kept behind `dyn Read` so fetch logic can be
/// exercised against scripted streams in tests.
pub struct SegmentStream {
    pub status: u16,
    pub body: Box<dyn Read + Send>,
}

pub trait NetClient: Send + Sync {
    fn probe(&self, req: &DownloadRequest) -> CoreResult<ProbeResponse>;
    fn get_stream(&self, req: &DownloadRequest) -> CoreResult<SegmentStream>;
}

pub struct ReqwestNetClient {
    client: Client,
}

impl ReqwestNetClient {
    pub fn new(
        user_agent: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> CoreResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(Self { client })
    }

    fn request_headers(&self, req: &DownloadRequest) -> CoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(value) = req.range_header() {
            headers.insert(
                RANGE,
                HeaderValue::from_str(&value).map_err(|err| CoreError::Network(err.to_string()))?,
            );
        }
        Ok(headers)
    }
}

impl NetClient for ReqwestNetClient {
    fn probe(&self, req: &DownloadRequest) -> CoreResult<ProbeResponse> {
        let mut request = self.client.head(&req.url);
        if let Some((user, pass)) = &req.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }
        let resp = request
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        let status = resp.status();
        let headers = resp.headers();
        let total_bytes = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let accept_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        Ok(ProbeResponse {
            status_code: status.as_u16(),
            total_bytes,
            accept_ranges,
        })
    }

    fn get_stream(&self, req: &DownloadRequest) -> CoreResult<SegmentStream> {
        let mut request = self
            .client
            .get(&req.url)
            .headers(self.request_headers(req)?);
        if let Some((user, pass)) = &req.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }
        let resp = request
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(SegmentStream {
            status: resp.status().as_u16(),
            body: Box::new(resp),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_is_open_ended_without_end() {
        let req = DownloadRequest::new("https://example.com/f").with_range(100, None);
        assert_eq!(req.range_header().as_deref(), Some("bytes=100-"));
    }

    #[test]
    fn range_header_is_bounded_with_end() {
        let req = DownloadRequest::new("https://example.com/f").with_range(0, Some(4095));
        assert_eq!(req.range_header().as_deref(), Some("bytes=0-4095"));
    }

    #[test]
    fn client_builds_with_timeouts() {
        let client = ReqwestNetClient::new(
            "tdm-test",
            Duration::from_secs(5),
            Duration::from_secs(10),
        );
        assert!(client.is_ok());
    }
}
