//! Topic grammar of the sharded topic space.
//!
//! Routing topics are `/` or `/<root>(/<0-3>)*`: an unbounded shard number followed by
//! quaternary subdivisions. Subscription topics may additionally end with a multi-level
//! wildcard `/#` or with one free-form word segment.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{FedError, Result};

pub const MULTI_LEVEL_WILDCARD: &str = "#";
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

static ROUTE_TOPIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/([0-9]+(/[0-3])*)?$").expect("route topic pattern"));

static SUBSCRIPTION_TOPIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:/|(?:/[0-9]+(?:/[0-3])*)?(?:/#|/[0-9A-Za-z_]+)?)$").expect("subscription topic pattern")
});

static IPV4_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(([0-9]|[1-9][0-9]|1[0-9][0-9]|2[0-4][0-9]|25[0-5])\.){3}([0-9]|[1-9][0-9]|1[0-9][0-9]|2[0-4][0-9]|25[0-5])$",
    )
    .expect("ipv4 pattern")
});

static DOMAIN_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-zA-Z0-9][a-zA-Z0-9-]{1,61}[a-zA-Z0-9]\.)+[a-zA-Z-]{2,}$").expect("domain pattern")
});

#[inline]
pub fn validate_route_topic(topic: &str) -> Result<()> {
    if ROUTE_TOPIC.is_match(topic) {
        Ok(())
    } else {
        Err(FedError::TopicFormat(topic.into()))
    }
}

#[inline]
pub fn validate_subscription_topic(topic: &str) -> Result<()> {
    if !topic.is_empty() && SUBSCRIPTION_TOPIC.is_match(topic) {
        Ok(())
    } else {
        Err(FedError::TopicFormat(topic.into()))
    }
}

/// Accepts an IPv4 literal, a dotted domain name or `localhost`.
#[inline]
pub fn validate_host(host: &str) -> Result<()> {
    if host == "localhost" || IPV4_HOST.is_match(host) || DOMAIN_HOST.is_match(host) {
        Ok(())
    } else {
        Err(FedError::HostFormat(host.into()))
    }
}

/// Non-empty segments of a topic, `/` has none.
#[inline]
pub fn segments(topic: &str) -> impl Iterator<Item = &str> {
    topic.split('/').filter(|s| !s.is_empty())
}

#[inline]
pub fn join<'a, I: IntoIterator<Item = &'a str>>(segments: I) -> String {
    let mut topic = String::new();
    for s in segments {
        topic.push('/');
        topic.push_str(s);
    }
    if topic.is_empty() {
        topic.push('/');
    }
    topic
}

/// The routing topic a subscription topic is served by.
///
/// `/1/2/#` and `/1/2/temp` route as `/1/2`, `/#` and `/temp` route as `/`.
pub fn route_key(topic: &str) -> Result<&str> {
    validate_subscription_topic(topic)?;
    let key = topic.strip_suffix("/#").unwrap_or(topic);
    if key.is_empty() {
        return Ok("/");
    }
    if ROUTE_TOPIC.is_match(key) {
        return Ok(key);
    }
    match key.rfind('/') {
        Some(0) | None => Ok("/"),
        Some(idx) => Ok(&key[..idx]),
    }
}

/// Like [`route_key`] but for topics that messages are published to, which carry no wildcard.
#[inline]
pub fn publish_route_key(topic: &str) -> Result<&str> {
    if topic.contains(MULTI_LEVEL_WILDCARD) || topic.contains(SINGLE_LEVEL_WILDCARD) {
        return Err(FedError::TopicFormat(topic.into()));
    }
    route_key(topic)
}

/// Whether `topic` equals `prefix` or lies below it, segment-wise.
#[inline]
pub fn is_within(topic: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return topic.starts_with('/');
    }
    match topic.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// MQTT topic filter matching with `+` and `#`.
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
