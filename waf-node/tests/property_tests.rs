//! Randomized invariants for the CIDR trie and the rate limiter

use ipnet::Ipv4Net;
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr};

use waf_node::blacklist::CidrTrie;
use waf_node::config::RateLimitConfig;
use waf_node::{RateDecision, RateLimiter};

proptest! {
    /// `contains(ip)` iff some inserted CIDR's prefix covers the address.
    #[test]
    fn trie_agrees_with_linear_scan(
        cidrs in proptest::collection::vec((any::<u32>(), 0u8..=32), 0..16),
        probes in proptest::collection::vec(any::<u32>(), 1..64),
    ) {
        let mut trie = CidrTrie::new();
        let mut nets = Vec::new();
        for (bits, prefix) in cidrs {
            let net = Ipv4Net::new(Ipv4Addr::from(bits), prefix).unwrap().trunc();
            trie.insert(&net.to_string()).unwrap();
            nets.push(net);
        }

        for probe in probes {
            let ip = Ipv4Addr::from(probe);
            let expected = nets.iter().any(|net| net.contains(&ip));
            prop_assert_eq!(trie.contains(IpAddr::V4(ip)), expected);
        }
    }

    /// Admitted count per key never exceeds the configured maximum inside
    /// one window.
    #[test]
    fn limiter_never_admits_more_than_configured(
        requests in 1usize..10,
        attempts in 1usize..50,
    ) {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: true,
            requests,
            window_seconds: 3600,
            cleanup_interval_seconds: 3600,
            paths: Vec::new(),
            match_all_paths: true,
        }).unwrap();

        let ip: IpAddr = "192.0.2.77".parse().unwrap();
        let admitted = (0..attempts)
            .filter(|_| limiter.check(ip, "/") == RateDecision::Allowed)
            .count();

        prop_assert_eq!(admitted, attempts.min(requests));
    }
}
