use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use lazy_static::lazy_static;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use tracing::{debug, instrument, warn};
use url::Url;

use super::plex::{Envelope, MediaContainer, PAGE_SIZES, SECTIONS_PATH};
use super::{ByteRange, ByteStream, ChildDescriptor, Transport};
use crate::errors::FetchError;
use crate::nodes::Locator;

lazy_static! {
    /// Identifies this process towards the server, stable for its lifetime.
    static ref CLIENT_IDENTIFIER: String = uuid::Uuid::new_v4().to_string();
}

/// Talks to a Plex Media Server over its HTTP JSON API.
///
/// Locators are server-relative paths: `/library/sections` for the root,
/// `/library/sections/{key}/all` for a section, `/library/metadata/{key}/children`
/// for shows and seasons, and part keys for file contents.
pub struct HttpTransport {
    base_url: String,
    client: ClientWithMiddleware,
}

impl HttpTransport {
    pub fn new(base_url: &Url, token: &str) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        let mut token = HeaderValue::from_str(token)
            .map_err(|e| FetchError::InvalidResponse(format!("invalid token: {}", e)))?;
        token.set_sensitive(true);
        headers.insert("X-Plex-Token", token);
        headers.insert(
            "X-Plex-Client-Identifier",
            HeaderValue::from_str(&CLIENT_IDENTIFIER)
                .map_err(|e| FetchError::InvalidResponse(e.to_string()))?,
        );
        headers.insert("X-Plex-Product", HeaderValue::from_static("mediafs"));
        headers.insert(
            "X-Plex-Version",
            HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
        );
        headers.insert(
            "X-Plex-Device",
            HeaderValue::from_static(std::env::consts::OS),
        );
        headers.insert("X-Plex-Platform", HeaderValue::from_static("Rust"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        // one-shot requests, a dropped read is resumed with a new range request.
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| FetchError::InvalidResponse(format!("unable to build client: {}", e)))?;

        let client = reqwest_middleware::ClientBuilder::new(client)
            .with(mediafs_tracing::http_tracing_middleware())
            .build();

        Ok(Self {
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, locator: &Locator) -> Result<Url, FetchError> {
        Url::parse(&format!("{}{}", self.base_url, locator)).map_err(|e| {
            warn!(err = %e, locator = %locator, "unable to construct url");
            FetchError::InvalidResponse(format!("invalid locator {}: {}", locator, e))
        })
    }

    async fn get_container(
        &self,
        locator: &Locator,
        page: Option<(u32, u32)>,
    ) -> Result<MediaContainer, FetchError> {
        let mut request = self.client.get(self.url(locator)?);
        if let Some((start, size)) = page {
            request = request
                .header("X-Plex-Container-Start", start)
                .header("X-Plex-Container-Size", size);
        }

        let resp = request.send().await.map_err(|e| {
            FetchError::Transient(format!("request for {} failed: {}", locator, e))
        })?;
        check_status(resp.status(), locator)?;

        let envelope: Envelope = resp.json().await.map_err(|e| {
            warn!(err = %e, locator = %locator, "unable to decode response");
            if e.is_decode() {
                FetchError::InvalidResponse(format!("unable to decode {}: {}", locator, e))
            } else {
                FetchError::Transient(format!("reading {} failed: {}", locator, e))
            }
        })?;
        Ok(envelope.media_container)
    }

    /// Section listings can be large, they are fetched in pages. A failing
    /// page is retried with a smaller page size before giving up.
    async fn list_paged(&self, locator: &Locator) -> Result<Vec<ChildDescriptor>, FetchError> {
        let mut sizes: &[u32] = &PAGE_SIZES;
        let mut start: u32 = 0;
        let mut children = Vec::new();

        loop {
            let size = sizes[0];
            match self.get_container(locator, Some((start, size))).await {
                Ok(container) => {
                    let received = container.metadata.len() as u32;
                    children.extend(container.metadata.iter().filter_map(|m| m.to_descriptor()));
                    start += received;
                    sizes = &PAGE_SIZES;

                    let done = match container.total_size {
                        Some(total) => start >= total,
                        None => received < size,
                    };
                    if done || received == 0 {
                        break;
                    }
                }
                Err(e @ (FetchError::Transient(_) | FetchError::InvalidResponse(_)))
                    if sizes.len() > 1 =>
                {
                    warn!(err = %e, page_size = size, next_page_size = sizes[1], "page failed, retrying smaller");
                    sizes = &sizes[1..];
                }
                Err(e) => return Err(e),
            }
        }

        debug!(locator = %locator, children = children.len(), "listed section");
        Ok(children)
    }
}

/// Classifies a response status into the fetch error taxonomy.
fn check_status(status: StatusCode, locator: &Locator) -> Result<(), FetchError> {
    if status.is_success() {
        return Ok(());
    }
    let reason = format!("{} for {}", status, locator);
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Unauthorized(reason),
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::NotFound(reason),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            FetchError::Transient(reason)
        }
        s if s.is_server_error() => FetchError::Transient(reason),
        _ => FetchError::InvalidResponse(reason),
    })
}

#[async_trait]
impl Transport for HttpTransport {
    fn root(&self) -> Locator {
        Locator::new(SECTIONS_PATH)
    }

    #[instrument(skip_all, fields(locator = %locator), err)]
    async fn list_children(&self, locator: &Locator) -> Result<Vec<ChildDescriptor>, FetchError> {
        let path = locator.as_str();
        if path == SECTIONS_PATH {
            let container = self.get_container(locator, None).await?;
            return Ok(container
                .directories
                .iter()
                .filter(|s| s.is_supported())
                .map(|s| s.to_descriptor())
                .collect());
        }

        if path.starts_with(SECTIONS_PATH) && path.ends_with("/all") {
            return self.list_paged(locator).await;
        }

        let container = self.get_container(locator, None).await?;
        Ok(container
            .metadata
            .iter()
            .filter_map(|m| m.to_descriptor())
            .collect())
    }

    #[instrument(skip_all, fields(locator = %locator, range = ?range), err)]
    async fn fetch(&self, locator: &Locator, range: ByteRange) -> Result<ByteStream, FetchError> {
        let range_header = match range.end {
            Some(end) => format!("bytes={}-{}", range.start, end.saturating_sub(1)),
            None => format!("bytes={}-", range.start),
        };

        let resp = self
            .client
            .get(self.url(locator)?)
            .header(header::RANGE, range_header)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("request for {} failed: {}", locator, e)))?;

        let status = resp.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // asked for bytes at or past EOF.
            return Ok(futures::stream::empty().boxed());
        }
        check_status(status, locator)?;

        // A server ignoring the range sends the whole file, skip the prefix.
        let mut skip = if status == StatusCode::PARTIAL_CONTENT {
            0
        } else {
            range.start
        };
        if skip > 0 {
            debug!(skip, "server ignored range request");
        }

        Ok(resp
            .bytes_stream()
            .map_err(|e| FetchError::Transient(format!("stream broke: {}", e.without_url())))
            .try_filter_map(move |mut chunk| {
                let out = if skip >= chunk.len() as u64 {
                    skip -= chunk.len() as u64;
                    None
                } else {
                    let tail = chunk.split_off(skip as usize);
                    skip = 0;
                    Some(tail)
                };
                futures::future::ready(Ok(out))
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use futures::TryStreamExt;
    use parking_lot::Mutex;
    use url::Url;

    use super::HttpTransport;
    use crate::errors::FetchError;
    use crate::fetch::{ByteRange, Transport};
    use crate::nodes::{Locator, NodeKind};

    const TOKEN: &str = "secret";
    const CONTENTS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    #[derive(Default)]
    struct FakePlex {
        /// Page sizes requested for the movie section, in order.
        page_sizes: Mutex<Vec<u32>>,
        client_ids: Mutex<Vec<String>>,
    }

    type Shared = Arc<FakePlex>;

    fn authorized(state: &FakePlex, headers: &HeaderMap) -> bool {
        if let Some(id) = headers
            .get("X-Plex-Client-Identifier")
            .and_then(|v| v.to_str().ok())
        {
            state.client_ids.lock().push(id.to_string());
        }
        headers.get("X-Plex-Token").and_then(|v| v.to_str().ok()) == Some(TOKEN)
            && headers.get("Accept").and_then(|v| v.to_str().ok()) == Some("application/json")
    }

    fn header_u32(headers: &HeaderMap, name: &str) -> u32 {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    async fn sections(State(state): State<Shared>, headers: HeaderMap) -> Response {
        if !authorized(&state, &headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        r#"{"MediaContainer":{"size":3,"Directory":[
            {"key":"1","title":"Movies","type":"movie","updatedAt":100},
            {"key":"2","title":"Music","type":"artist","updatedAt":100},
            {"key":"3","title":"TV Shows","type":"show","updatedAt":200}
        ]}}"#
            .into_response()
    }

    /// Three movies, served at most two per page. Pages of 500 fail.
    async fn movies(State(state): State<Shared>, headers: HeaderMap) -> Response {
        if !authorized(&state, &headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let start = header_u32(&headers, "X-Plex-Container-Start") as usize;
        let size = header_u32(&headers, "X-Plex-Container-Size");
        state.page_sizes.lock().push(size);
        if size >= 500 {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }

        let all = [
            r#"{"ratingKey":"11","type":"movie","title":"Alien","year":1979,"Media":[{"Part":[{"key":"/library/parts/11/file.mkv","file":"/m/Alien.mkv","size":36}]}]}"#,
            r#"{"ratingKey":"12","type":"movie","title":"Heat","year":1995,"Media":[{"Part":[{"key":"/library/parts/12/file.mkv","file":"/m/Heat.mkv","size":36}]}]}"#,
            r#"{"ratingKey":"13","type":"movie","title":"Ran","year":1985,"Media":[{"Part":[{"key":"/library/parts/13/file.avi","file":"/m/Ran.avi","size":36}]}]}"#,
        ];
        let page: Vec<&str> = all.iter().skip(start).take(2).copied().collect();
        format!(
            r#"{{"MediaContainer":{{"size":{},"totalSize":3,"Metadata":[{}]}}}}"#,
            page.len(),
            page.join(",")
        )
        .into_response()
    }

    async fn children(
        State(state): State<Shared>,
        Path(key): Path<String>,
        headers: HeaderMap,
    ) -> Response {
        if !authorized(&state, &headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        match key.as_str() {
            "30" => r#"{"MediaContainer":{"Metadata":[{"ratingKey":"31","type":"season","index":1}]}}"#
                .into_response(),
            _ => StatusCode::NOT_FOUND.into_response(),
        }
    }

    /// Serves [CONTENTS], honoring a `bytes=a-b` / `bytes=a-` range.
    async fn part(headers: HeaderMap) -> Response {
        let Some(range) = headers.get("Range").and_then(|v| v.to_str().ok()) else {
            return CONTENTS.into_response();
        };
        let Some((start, end)) = range
            .strip_prefix("bytes=")
            .and_then(|r| r.split_once('-'))
        else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        let start: usize = start.parse().unwrap_or(0);
        let end: usize = end
            .parse::<usize>()
            .map(|e| (e + 1).min(CONTENTS.len()))
            .unwrap_or(CONTENTS.len());
        if start >= CONTENTS.len() {
            return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
        }
        (StatusCode::PARTIAL_CONTENT, CONTENTS[start..end].to_vec()).into_response()
    }

    /// Ignores range requests entirely.
    async fn part_no_ranges() -> Response {
        CONTENTS.into_response()
    }

    async fn serve() -> (Url, Shared) {
        let state = Shared::default();
        let app = Router::new()
            .route("/library/sections", get(sections))
            .route("/library/sections/1/all", get(movies))
            .route("/library/metadata/:key/children", get(children))
            .route("/library/parts/1/file.mkv", get(part))
            .route("/library/parts/2/file.mkv", get(part_no_ranges))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        (Url::parse(&format!("http://{}/", addr)).unwrap(), state)
    }

    async fn collect(transport: &HttpTransport, locator: &str, range: ByteRange) -> Vec<u8> {
        let chunks: Vec<_> = transport
            .fetch(&Locator::new(locator), range)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn lists_supported_sections() {
        let (url, state) = serve().await;
        let transport = HttpTransport::new(&url, TOKEN).unwrap();

        let sections = transport.list_children(&transport.root()).await.unwrap();

        let names: Vec<_> = sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(vec!["Movies", "TV Shows"], names);
        assert_eq!(Some(200), sections[1].change_marker);
        assert!(!state.client_ids.lock().is_empty());
    }

    #[tokio::test]
    async fn pages_shrink_on_failure_and_reset() {
        let (url, state) = serve().await;
        let transport = HttpTransport::new(&url, TOKEN).unwrap();

        let movies = transport
            .list_children(&Locator::new("/library/sections/1/all"))
            .await
            .unwrap();

        let names: Vec<_> = movies.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            vec!["Alien (1979).mkv", "Heat (1995).mkv", "Ran (1985).avi"],
            names
        );
        assert_eq!(vec![500, 200, 500, 200], *state.page_sizes.lock());
    }

    #[tokio::test]
    async fn metadata_children() {
        let (url, _) = serve().await;
        let transport = HttpTransport::new(&url, TOKEN).unwrap();

        let seasons = transport
            .list_children(&Locator::new("/library/metadata/30/children"))
            .await
            .unwrap();
        assert_eq!(1, seasons.len());
        assert_eq!("Season 01", seasons[0].name);
        assert_eq!(NodeKind::Directory, seasons[0].kind);

        assert!(matches!(
            transport
                .list_children(&Locator::new("/library/metadata/99/children"))
                .await,
            Err(FetchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn wrong_token_is_unauthorized() {
        let (url, _) = serve().await;
        let transport = HttpTransport::new(&url, "wrong").unwrap();

        assert!(matches!(
            transport.list_children(&transport.root()).await,
            Err(FetchError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn ranges() {
        let (url, _) = serve().await;
        let transport = HttpTransport::new(&url, TOKEN).unwrap();

        assert_eq!(
            b"3456".to_vec(),
            collect(&transport, "/library/parts/1/file.mkv", ByteRange::new(3, 7)).await
        );
        assert_eq!(
            CONTENTS[30..].to_vec(),
            collect(
                &transport,
                "/library/parts/1/file.mkv",
                ByteRange::from_offset(30)
            )
            .await
        );
        assert!(collect(
            &transport,
            "/library/parts/1/file.mkv",
            ByteRange::from_offset(100)
        )
        .await
        .is_empty());
    }

    #[tokio::test]
    async fn ignored_range_skips_prefix() {
        let (url, _) = serve().await;
        let transport = HttpTransport::new(&url, TOKEN).unwrap();

        let data = collect(
            &transport,
            "/library/parts/2/file.mkv",
            ByteRange::from_offset(10),
        )
        .await;
        assert_eq!(CONTENTS[10..].to_vec(), data);
    }
}
