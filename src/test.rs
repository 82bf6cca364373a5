use crate::{
    CacheControl, ConfigError, Headers, Matcher, ResponseMeta, Rules,
    StoredResponse, Trace, TraceToken, TtlSpec,
};

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{
    AGE, ALLOW, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, DATE, ETAG,
    LAST_MODIFIED,
};
use http::{HeaderMap, HeaderValue, Response, StatusCode};

use crate::error::Result;

const TEST_BODY: &[u8] = b"test";

#[test]
fn error_types_display() {
    let spent = crate::DownstreamExhausted;
    assert_eq!(spent.to_string(), "Backend already invoked for this request");
    let config = ConfigError::InvertedClamp { index: 2, min: 9, max: 3 };
    assert_eq!(config.to_string(), "rule 2: clamp range is inverted (9 > 3)");
}

fn response(
    status: u16,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Response<Bytes> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Bytes::copy_from_slice(body)).unwrap()
}

fn meta_at(
    status: u16,
    headers: &[(&str, &str)],
    now: SystemTime,
) -> ResponseMeta {
    ResponseMeta::at(response(status, headers, TEST_BODY), now)
}

fn http_date(instant: SystemTime) -> String {
    httpdate::fmt_http_date(instant)
}

#[test]
fn control_round_trips() {
    let control = CacheControl::parse(
        "public, max-age=60, s-maxage=120, stale-while-revalidate=30, \
         no-transform",
    );
    assert!(control.public);
    assert_eq!(control.max_age, Some(60));
    assert_eq!(control.s_maxage, Some(120));
    assert_eq!(
        control.extension("stale-while-revalidate"),
        Some(Some("30"))
    );
    assert_eq!(control.extension("no-transform"), Some(None));

    let reparsed =
        CacheControl::parse(&control.to_header_value().unwrap());
    assert_eq!(reparsed, control);
}

#[test]
fn control_absorbs_junk() {
    let control = CacheControl::parse(" ,, max-age=abc , ,NO-STORE,");
    assert!(control.no_store);
    assert_eq!(control.max_age, None);

    let empty = CacheControl::parse("");
    assert!(empty.is_empty());
    assert_eq!(empty.to_header_value(), None);
}

#[test]
fn control_quoted_seconds() {
    let control = CacheControl::parse("max-age=\"90\"");
    assert_eq!(control.max_age, Some(90));
}

#[test]
fn age_prefers_age_header() {
    let now = SystemTime::now();
    let date = http_date(now - Duration::from_secs(100));
    let meta =
        meta_at(200, &[("date", date.as_str()), ("age", "30")], now);
    assert_eq!(meta.age(), 30);
}

#[test]
fn age_falls_back_to_date() {
    let now = SystemTime::now();
    let date = http_date(now - Duration::from_secs(100));
    let meta = meta_at(200, &[("date", date.as_str())], now);
    assert_eq!(meta.age(), 100);
}

#[test]
fn future_date_clamps_age_to_zero() {
    let now = SystemTime::now();
    let date = http_date(now + Duration::from_secs(100));
    let meta = meta_at(200, &[("date", date.as_str())], now);
    assert_eq!(meta.age(), 0);
}

#[test]
fn missing_everything_means_age_zero() {
    let meta = meta_at(200, &[], SystemTime::now());
    assert_eq!(meta.age(), 0);
    assert_eq!(meta.max_age(), None);
    assert_eq!(meta.ttl(), None);
    assert!(!meta.is_fresh());
}

#[test]
fn s_maxage_wins_over_max_age() {
    let meta = meta_at(
        200,
        &[("cache-control", "max-age=10, s-maxage=60")],
        SystemTime::now(),
    );
    assert_eq!(meta.max_age(), Some(60));
}

#[test]
fn max_age_from_expires_and_date() {
    let now = SystemTime::now();
    let date = http_date(now - Duration::from_secs(10));
    let expires = http_date(now + Duration::from_secs(50));
    let meta = meta_at(
        200,
        &[("date", date.as_str()), ("expires", expires.as_str())],
        now,
    );
    // Expires − Date = 60, age = 10
    assert_eq!(meta.max_age(), Some(60));
    assert_eq!(meta.ttl(), Some(50));
    assert!(meta.is_fresh());
}

#[test]
fn expires_alone_measures_from_now() {
    let now = SystemTime::now();
    let expires = http_date(now + Duration::from_secs(40));
    let meta = meta_at(200, &[("expires", expires.as_str())], now);
    assert_eq!(meta.max_age(), Some(40));
    assert!(meta.is_fresh());
}

#[test]
fn expired_expires_is_not_fresh() {
    let now = SystemTime::now();
    let expires = http_date(now - Duration::from_secs(40));
    let meta = meta_at(200, &[("expires", expires.as_str())], now);
    assert_eq!(meta.max_age(), Some(0));
    assert!(!meta.is_fresh());
}

#[test]
fn malformed_dates_read_as_absent() {
    let meta = meta_at(
        200,
        &[("date", "yesterday-ish"), ("expires", "soon")],
        SystemTime::now(),
    );
    assert_eq!(meta.date(), None);
    assert_eq!(meta.expires(), None);
    assert_eq!(meta.max_age(), None);
}

#[test]
fn fresh_implies_positive_ttl_and_budget() {
    let now = SystemTime::now();
    let date = http_date(now - Duration::from_secs(30));
    let meta = meta_at(
        200,
        &[("date", date.as_str()), ("cache-control", "max-age=60")],
        now,
    );
    assert!(meta.is_fresh());
    assert!(meta.ttl().unwrap() > 0);
    assert!(meta.max_age().unwrap() >= meta.age());
}

#[test]
fn set_ttl_extends_from_now() {
    let now = SystemTime::now();
    let date = http_date(now - Duration::from_secs(20));
    let mut meta = meta_at(200, &[("date", date.as_str())], now);
    meta.set_ttl(60);
    assert_eq!(meta.control().s_maxage, Some(80));
    assert_eq!(meta.ttl(), Some(60));
    assert!(meta.is_fresh());
}

#[test]
fn expire_drives_ttl_to_zero() {
    let meta_headers = [("cache-control", "max-age=60")];
    let mut meta = meta_at(200, &meta_headers, SystemTime::now());
    assert!(meta.is_fresh());
    meta.expire();
    assert_eq!(meta.ttl(), Some(0));
    assert!(!meta.is_fresh());

    // expiring something that was never fresh is a no-op
    let mut bare = meta_at(200, &[], SystemTime::now());
    bare.expire();
    assert_eq!(bare.ttl(), None);
}

#[test]
fn validateable_needs_a_validator() {
    let now = SystemTime::now();
    assert!(!meta_at(200, &[], now).is_validateable());
    assert!(meta_at(200, &[("etag", "\"x\"")], now).is_validateable());
    assert!(meta_at(200, &[("last-modified", "whenever")], now)
        .is_validateable());
}

#[test]
fn cacheable_statuses_only() {
    let now = SystemTime::now();
    let headers = [("cache-control", "max-age=60")];
    for status in [200u16, 203, 300, 301, 302, 404, 410] {
        assert!(meta_at(status, &headers, now).is_cacheable(), "{status}");
    }
    for status in [201u16, 204, 206, 303, 307, 400, 403, 500, 503] {
        assert!(!meta_at(status, &headers, now).is_cacheable(), "{status}");
    }
}

#[test]
fn no_store_and_private_are_never_cacheable() {
    let now = SystemTime::now();
    let no_store = [("cache-control", "no-store, max-age=60")];
    assert!(!meta_at(200, &no_store, now).is_cacheable());
    let private = [("cache-control", "private, max-age=60")];
    assert!(!meta_at(200, &private, now).is_cacheable());
}

#[test]
fn cacheable_needs_freshness_or_validator() {
    let now = SystemTime::now();
    assert!(!meta_at(200, &[], now).is_cacheable());
    assert!(meta_at(200, &[("etag", "\"x\"")], now).is_cacheable());
    assert!(meta_at(200, &[("cache-control", "max-age=60")], now)
        .is_cacheable());
}

#[test]
fn must_revalidate_variants() {
    let now = SystemTime::now();
    assert!(meta_at(200, &[("cache-control", "must-revalidate")], now)
        .is_must_revalidate());
    assert!(meta_at(200, &[("cache-control", "proxy-revalidate")], now)
        .is_must_revalidate());
    assert!(!meta_at(200, &[], now).is_must_revalidate());
}

#[test]
fn make_not_modified_strips_entity_headers() {
    let mut meta = meta_at(
        200,
        &[
            ("content-type", "text/html"),
            ("content-length", "4"),
            ("content-md5", "abcd"),
            ("allow", "GET"),
            ("last-modified", "then"),
            ("etag", "\"x\""),
        ],
        SystemTime::now(),
    );
    meta.make_not_modified();
    assert_eq!(meta.status(), StatusCode::NOT_MODIFIED);
    assert!(meta.body().is_empty());
    for name in
        [CONTENT_TYPE, CONTENT_LENGTH, ALLOW, LAST_MODIFIED]
    {
        assert!(!meta.headers().contains_key(&name), "{name:?}");
    }
    assert!(!meta.headers().contains_key("content-md5"));
    // the validator the client can use survives
    assert!(meta.headers().contains_key(ETAG));
}

#[test]
fn finalize_reemits_the_directive_map() {
    let mut meta = meta_at(
        200,
        &[("cache-control", "max-age=10")],
        SystemTime::now(),
    );
    meta.control_mut().private = true;
    let response = meta.finalize();
    let value =
        response.headers().get(CACHE_CONTROL).unwrap().to_str().unwrap();
    let control = CacheControl::parse(value);
    assert!(control.private);
    assert_eq!(control.max_age, Some(10));
}

#[test]
fn finalize_drops_an_empty_directive_map() {
    // an empty Cache-Control header parses to an empty map and the header
    // is not re-emitted
    let meta =
        meta_at(200, &[("cache-control", "")], SystemTime::now());
    let response = meta.finalize();
    assert!(response.headers().get(CACHE_CONTROL).is_none());
}

#[test]
fn merge_not_modified_copies_by_name() {
    let now = SystemTime::now();
    let old_date = http_date(now - Duration::from_secs(120));
    let mut stored = meta_at(
        200,
        &[
            ("date", old_date.as_str()),
            ("cache-control", "max-age=60"),
            ("age", "90"),
            ("content-type", "text/plain"),
        ],
        now,
    );

    let new_date = http_date(now);
    let mut fresh = HeaderMap::new();
    fresh.insert(DATE, HeaderValue::from_str(&new_date).unwrap());
    fresh.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=300"));
    fresh.insert(ETAG, HeaderValue::from_static("\"r2\""));

    stored.merge_not_modified(&fresh);
    assert_eq!(stored.date(), httpdate::parse_http_date(&new_date).ok());
    assert_eq!(stored.control().max_age, Some(300));
    assert_eq!(stored.etag(), Some("\"r2\""));
    // the stale Age is gone, so freshness is measured against the new Date
    assert!(!stored.headers().contains_key(AGE));
    assert!(stored.is_fresh());
    // untouched headers survive
    assert!(stored.headers().contains_key(CONTENT_TYPE));
}

#[test]
fn refresh_age_recomputes_from_date() {
    let now = SystemTime::now();
    let date = http_date(now - Duration::from_secs(42));
    let mut meta =
        meta_at(200, &[("date", date.as_str()), ("age", "7")], now);
    meta.refresh_age();
    assert_eq!(meta.age(), 42);
}

#[test]
fn stored_round_trip() {
    let now = SystemTime::now();
    let mut meta = meta_at(
        200,
        &[("content-type", "text/plain"), ("etag", "\"x\"")],
        now,
    );
    meta.set_ttl(60);
    let stored = meta.to_stored();
    // the applied lifetime is written through to the stored copy
    assert!(stored
        .headers
        .get("cache-control")
        .unwrap()
        .contains("s-maxage=60"));

    let revived = ResponseMeta::from_stored(&stored);
    assert_eq!(revived.status(), StatusCode::OK);
    assert_eq!(revived.body().as_ref(), TEST_BODY);
    assert_eq!(revived.etag(), Some("\"x\""));
    assert!(revived.is_fresh());
}

#[test]
fn stored_response_survives_bad_status() {
    let stored = StoredResponse {
        status: 1000,
        headers: Headers::new(),
        body: Vec::new(),
    };
    let revived = ResponseMeta::from_stored(&stored);
    assert_eq!(revived.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[test]
fn headers_are_case_insensitive_multimaps() {
    let mut headers = Headers::new();
    headers.append("Set-Cookie", "a=1".to_owned());
    headers.append("set-cookie", "b=2".to_owned());
    assert_eq!(headers.get("SET-COOKIE"), Some("a=1"));
    assert_eq!(headers.get_all("set-cookie"), ["a=1", "b=2"]);

    headers.insert("Set-Cookie", "c=3".to_owned());
    assert_eq!(headers.get_all("set-cookie"), ["c=3"]);

    headers.remove("SET-cookie");
    assert!(!headers.contains("set-cookie"));
}

#[test]
fn headers_convert_both_ways() {
    let mut map = HeaderMap::new();
    map.append("x-a", HeaderValue::from_static("1"));
    map.append("x-a", HeaderValue::from_static("2"));
    map.insert("x-b", HeaderValue::from_static("3"));

    let headers = Headers::from(&map);
    assert_eq!(headers.get_all("x-a"), ["1", "2"]);

    let back = headers.to_header_map();
    let values: Vec<_> = back.get_all("x-a").iter().collect();
    assert_eq!(values.len(), 2);
    assert_eq!(back.get("x-b").unwrap(), "3");
}

#[test]
fn rules_first_match_wins() -> Result<()> {
    let rules = Rules::new()
        .push(Matcher::path("^/api/private")?, TtlSpec::Invalidate)
        .push(Matcher::path("^/api")?, TtlSpec::Fixed(60))
        .push(Matcher::path("")?, TtlSpec::Fixed(10));

    assert_eq!(
        rules.matched("/api/private/x").unwrap().ttl,
        TtlSpec::Invalidate
    );
    assert_eq!(rules.matched("/api/users").unwrap().ttl, TtlSpec::Fixed(60));
    assert_eq!(rules.matched("/other").unwrap().ttl, TtlSpec::Fixed(10));
    Ok(())
}

#[test]
fn empty_rules_match_nothing() {
    assert!(Rules::new().matched("/anything").is_none());
}

#[test]
fn rewrite_matcher_only_commits_on_match() -> Result<()> {
    let rules = Rules::new()
        .push(
            Matcher::rewrite(|path| {
                // always rewrites, only sometimes matches
                let matched = path.starts_with("/old");
                *path = path.replace("/old", "/new");
                matched
            }),
            TtlSpec::Fixed(30),
        )
        .push(Matcher::path("^/untouched")?, TtlSpec::Fixed(5));

    let matched = rules.matched("/old/page").unwrap();
    assert_eq!(matched.path, "/new/page");

    // the non-matching invocation's edit is discarded before the next rule
    let fallthrough = rules.matched("/untouched").unwrap();
    assert_eq!(fallthrough.ttl, TtlSpec::Fixed(5));
    assert_eq!(fallthrough.path, "/untouched");
    Ok(())
}

#[test]
fn rule_validation_catches_misconfiguration() -> Result<()> {
    let zero = Rules::new().push(Matcher::path("^/")?, TtlSpec::Fixed(0));
    assert_eq!(zero.validate(), Err(ConfigError::ZeroTtl { index: 0 }));

    let inverted = Rules::new().push(
        Matcher::path("^/")?,
        TtlSpec::Clamp { min: Some(60), max: Some(30) },
    );
    assert_eq!(
        inverted.validate(),
        Err(ConfigError::InvertedClamp { index: 0, min: 60, max: 30 })
    );

    let fine = Rules::new()
        .push(Matcher::path("^/")?, TtlSpec::Fixed(1))
        .push(
            Matcher::path("^/x")?,
            TtlSpec::Clamp { min: Some(10), max: None },
        );
    assert!(fine.validate().is_ok());
    Ok(())
}

#[test]
fn clamp_resolution() {
    let clamp = TtlSpec::Clamp { min: Some(10), max: Some(60) };
    assert_eq!(clamp.resolve(Some(30)), Some(30));
    assert_eq!(clamp.resolve(Some(5)), Some(10));
    assert_eq!(clamp.resolve(Some(600)), Some(60));
    // no declared lifetime: the lower bound applies
    assert_eq!(clamp.resolve(None), Some(10));
    assert_eq!(clamp.resolve(Some(-5)), Some(10));

    let unbounded = TtlSpec::Clamp { min: None, max: Some(60) };
    assert_eq!(unbounded.resolve(None), None);

    assert_eq!(TtlSpec::Fixed(60).resolve(Some(600)), Some(60));
    assert_eq!(TtlSpec::Invalidate.resolve(Some(600)), None);
}

#[test]
fn trace_renders_in_entry_order() {
    let mut trace = Trace::new();
    trace.push(TraceToken::Lookup);
    trace.push(TraceToken::Miss);
    trace.push(TraceToken::Fetch);
    trace.push(TraceToken::Store);
    assert_eq!(trace.header_value(), "lookup, miss, fetch, store");
    assert_eq!(trace.to_string(), trace.header_value());
    assert!(trace.contains(TraceToken::Miss));
    assert!(!trace.contains(TraceToken::Hit));
    assert_eq!(TraceToken::NotModified.to_string(), "notmodified");
}

#[cfg(feature = "manager-moka")]
mod with_moka {
    use super::*;
    use crate::{CacheEntry, MokaStorage, Storage};

    fn entry(body: &[u8]) -> CacheEntry {
        CacheEntry {
            request_headers: Headers::new(),
            response: StoredResponse {
                status: 200,
                headers: Headers::new(),
                body: body.to_vec(),
            },
        }
    }

    #[tokio::test]
    async fn moka_round_trip() -> Result<()> {
        let storage = MokaStorage::default();
        assert_eq!(format!("{storage:?}"), "MokaStorage { .. }");

        let key = "https://example.com/a";
        storage
            .set(key.to_owned(), entry(TEST_BODY), None)
            .await?;
        let found = storage.get(key).await?.unwrap();
        assert_eq!(found.response.body, TEST_BODY);

        storage.remove(key).await?;
        assert!(storage.get(key).await?.is_none());

        storage.set(key.to_owned(), entry(TEST_BODY), None).await?;
        storage.clear().await;
        assert!(storage.get(key).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn moka_honours_entry_ttl() -> Result<()> {
        let storage = MokaStorage::new(16);
        let key = "https://example.com/ttl";
        storage
            .set(
                key.to_owned(),
                entry(TEST_BODY),
                Some(Duration::from_millis(50)),
            )
            .await?;
        assert!(storage.get(key).await?.is_some());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(storage.get(key).await?.is_none());
        Ok(())
    }
}
