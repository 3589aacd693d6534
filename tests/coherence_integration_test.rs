// Integration tests for the token coherence protocol end to end:
// cold reads distributing tokens over the ring, write-driven token
// acquisition, eviction cascades into the root, and the round-trip
// laws that tie them together.

#[cfg(test)]
mod coherence_integration_tests {
    use ringmem::memory::Permissions;
    use ringmem::{MemAddr, MemoryClient, SimConfig, System, WriteId};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Record {
        reads: Vec<(MemAddr, Vec<u8>)>,
        writes: Vec<WriteId>,
        invalidations: Vec<MemAddr>,
        snoops: Vec<(MemAddr, Vec<u8>)>,
    }

    #[derive(Clone)]
    struct TestClient(Rc<RefCell<Record>>);

    impl TestClient {
        fn new() -> Self {
            Self(Rc::new(RefCell::new(Record::default())))
        }
    }

    impl MemoryClient for TestClient {
        fn on_read_completed(&mut self, address: MemAddr, data: &[u8]) -> bool {
            self.0.borrow_mut().reads.push((address, data.to_vec()));
            true
        }
        fn on_write_completed(&mut self, wid: WriteId) -> bool {
            self.0.borrow_mut().writes.push(wid);
            true
        }
        fn on_memory_invalidated(&mut self, address: MemAddr) -> bool {
            self.0.borrow_mut().invalidations.push(address);
            true
        }
        fn on_memory_snooped(&mut self, address: MemAddr, data: &[u8]) -> bool {
            self.0.borrow_mut().snoops.push((address, data.to_vec()));
            true
        }
    }

    /// One ring of four caches, one root, small sets so evictions are
    /// easy to force, no eviction injection (scenario 4 expects the
    /// evicted line to travel all the way to the root).
    fn scenario_config() -> SimConfig {
        SimConfig {
            l2_cache_num_sets: 1,
            l2_cache_associativity: 2,
            num_root_directories: 1,
            inject_evicted_lines: false,
            ..SimConfig::default()
        }
    }

    fn build_system(config: SimConfig) -> System {
        let mut system = System::new(config).unwrap();
        system
            .reserve(0, 1 << 20, Permissions::READ | Permissions::WRITE)
            .unwrap();
        system
    }

    fn admit_read(system: &mut System, cache: usize, client: usize, address: MemAddr) {
        for _ in 0..100 {
            if system.cache_read(cache, client, address).unwrap() {
                return;
            }
            system.step().unwrap();
        }
        panic!("read at {address:#x} was never admitted");
    }

    fn admit_write(
        system: &mut System,
        cache: usize,
        client: usize,
        address: MemAddr,
        data: &[u8],
        wid: WriteId,
    ) {
        for _ in 0..100 {
            if system.cache_write(cache, client, address, data, wid).unwrap() {
                return;
            }
            system.step().unwrap();
        }
        panic!("write at {address:#x} was never admitted");
    }

    fn drain(system: &mut System) {
        system.run_until_idle(20_000).unwrap();
        system.verify().unwrap();
    }

    #[test]
    fn test_cold_read_distributes_tokens() {
        let mut system = build_system(scenario_config());
        let client = TestClient::new();
        let c0 = system.register_client(0, Box::new(client.clone())).unwrap();

        admit_read(&mut system, 0, c0, 0x1000);
        drain(&mut system);

        // The requester ends with one token plus priority; every
        // cache the read passed kept a copy with one token.
        let line0 = system.cache(0).probe(0x1000).expect("line on cache 0");
        assert_eq!(line0.tokens, 1);
        assert!(line0.priority);
        for cache in 1..4 {
            let line = system
                .cache(cache)
                .probe(0x1000)
                .unwrap_or_else(|| panic!("no copy on cache {cache}"));
            assert_eq!(line.tokens, 1, "cache {cache}");
            assert!(!line.priority, "cache {cache}");
        }

        let root = system.root(0).probe(0x1000).expect("root line");
        assert_eq!(root.tokens, 0);
        assert!(root.data);
        assert!(!root.loading);

        // Cold memory reads as zeroes.
        let record = client.0.borrow();
        assert_eq!(record.reads.len(), 1);
        assert_eq!(record.reads[0].0, 0x1000);
        assert!(record.reads[0].1.iter().all(|&b| b == 0));

        assert_eq!(system.stats().offchip_reads, 1);
    }

    #[test]
    fn test_write_collects_every_token() {
        let mut system = build_system(scenario_config());
        let client = TestClient::new();
        let c0 = system.register_client(0, Box::new(client.clone())).unwrap();
        let peers: Vec<TestClient> = (1..4)
            .map(|cache| {
                let peer = TestClient::new();
                system.register_client(cache, Box::new(peer.clone())).unwrap();
                peer
            })
            .collect();

        admit_read(&mut system, 0, c0, 0x1000);
        drain(&mut system);

        admit_write(&mut system, 0, c0, 0x1000, &0xDEADBEEFu32.to_le_bytes(), 7);
        drain(&mut system);

        // Cache 0 owns everything; the other copies are gone.
        let line0 = system.cache(0).probe(0x1000).expect("line on cache 0");
        assert_eq!(line0.tokens, 4);
        assert!(line0.priority);
        assert!(line0.dirty);
        assert_eq!(&line0.data[..4], &0xDEADBEEFu32.to_le_bytes());
        for cache in 1..4 {
            assert!(
                system.cache(cache).probe(0x1000).is_none(),
                "cache {cache} kept a stale copy"
            );
        }
        for (i, peer) in peers.iter().enumerate() {
            assert_eq!(
                peer.0.borrow().invalidations,
                vec![0x1000],
                "cache {} missed its invalidation",
                i + 1
            );
        }
        assert_eq!(client.0.borrow().writes, vec![7]);
    }

    #[test]
    fn test_read_after_remote_write_sees_new_data() {
        let mut system = build_system(scenario_config());
        let writer = TestClient::new();
        let reader = TestClient::new();
        let c0 = system.register_client(0, Box::new(writer.clone())).unwrap();
        let c1 = system.register_client(1, Box::new(reader.clone())).unwrap();

        admit_read(&mut system, 0, c0, 0x1000);
        drain(&mut system);
        admit_write(&mut system, 0, c0, 0x1000, &0xDEADBEEFu32.to_le_bytes(), 7);
        drain(&mut system);

        admit_read(&mut system, 1, c1, 0x1000);
        drain(&mut system);

        // The writer answered with one token and kept the rest.
        let line1 = system.cache(1).probe(0x1000).expect("line on cache 1");
        assert_eq!(line1.tokens, 1);
        assert_eq!(&line1.data[..4], &0xDEADBEEFu32.to_le_bytes());
        let line0 = system.cache(0).probe(0x1000).expect("line on cache 0");
        assert_eq!(line0.tokens, 3);

        let record = reader.0.borrow();
        assert_eq!(record.reads.len(), 1);
        assert_eq!(&record.reads[0].1[..4], &0xDEADBEEFu32.to_le_bytes());
    }

    #[test]
    fn test_eviction_cascade_retires_line_at_root() {
        let mut system = build_system(scenario_config());
        let writer = TestClient::new();
        let reader = TestClient::new();
        let c0 = system.register_client(0, Box::new(writer.clone())).unwrap();
        let c1 = system.register_client(1, Box::new(reader.clone())).unwrap();

        admit_read(&mut system, 0, c0, 0x1000);
        drain(&mut system);
        admit_write(&mut system, 0, c0, 0x1000, &0xDEADBEEFu32.to_le_bytes(), 7);
        drain(&mut system);
        admit_read(&mut system, 1, c1, 0x1000);
        drain(&mut system);

        // Force 0x1000 out of cache 1 (two fresh lines overflow the
        // two ways), then out of cache 0.
        admit_read(&mut system, 1, c1, 0x4000);
        drain(&mut system);
        admit_read(&mut system, 1, c1, 0x5000);
        drain(&mut system);
        assert!(system.cache(1).probe(0x1000).is_none());

        admit_read(&mut system, 0, c0, 0x2000);
        drain(&mut system);
        admit_read(&mut system, 0, c0, 0x3000);
        drain(&mut system);
        assert!(system.cache(0).probe(0x1000).is_none());

        // Every token returned: the root retired the line and wrote
        // the dirty data back.
        assert!(system.root(0).probe(0x1000).is_none(), "root line cleared");
        let mut check = [0u8; 4];
        system.memory().read(0x1000, &mut check).unwrap();
        assert_eq!(check, 0xDEADBEEFu32.to_le_bytes());
        assert!(system.stats().offchip_writes >= 1);

        // Eviction-then-read returns the most recently acked write.
        admit_read(&mut system, 1, c1, 0x1000);
        drain(&mut system);
        let record = reader.0.borrow();
        let last = record.reads.last().expect("read completed");
        assert_eq!(last.0, 0x1000);
        assert_eq!(&last.1[..4], &0xDEADBEEFu32.to_le_bytes());
    }

    #[test]
    fn test_write_then_read_from_every_cache() {
        let mut system = build_system(SimConfig {
            num_root_directories: 1,
            ..SimConfig::default()
        });
        let clients: Vec<TestClient> = (0..4)
            .map(|cache| {
                let client = TestClient::new();
                system.register_client(cache, Box::new(client.clone())).unwrap();
                client
            })
            .collect();

        admit_write(&mut system, 2, 0, 0x7000, &[0x11, 0x22, 0x33], 1);
        drain(&mut system);
        assert_eq!(clients[2].0.borrow().writes, vec![1]);

        for cache in 0..4 {
            admit_read(&mut system, cache, 0, 0x7000);
            drain(&mut system);
            let record = clients[cache].0.borrow();
            let (address, data) = record.reads.last().expect("read completed");
            assert_eq!(*address, 0x7000);
            assert_eq!(&data[..3], &[0x11, 0x22, 0x33], "cache {cache}");
        }
    }

    #[test]
    fn test_concurrent_readers_chain_without_deadlock() {
        let mut system = build_system(SimConfig {
            num_root_directories: 1,
            ..SimConfig::default()
        });
        let r1 = TestClient::new();
        let r2 = TestClient::new();
        let c1 = system.register_client(1, Box::new(r1.clone())).unwrap();
        let c2 = system.register_client(2, Box::new(r2.clone())).unwrap();

        // Both misses are outstanding at once; the second requester
        // must be chained behind the first, not deadlocked.
        admit_read(&mut system, 1, c1, 0x8000);
        admit_read(&mut system, 2, c2, 0x8000);
        drain(&mut system);

        assert_eq!(r1.0.borrow().reads.len(), 1);
        assert_eq!(r2.0.borrow().reads.len(), 1);
        let line1 = system.cache(1).probe(0x8000).expect("line on cache 1");
        let line2 = system.cache(2).probe(0x8000).expect("line on cache 2");
        assert!(line1.tokens >= 1);
        assert!(line2.tokens >= 1);
        assert_eq!(system.stats().offchip_reads, 1, "one off-chip fetch serves both");
    }

    #[test]
    fn test_snooped_write_reaches_peers_before_admission() {
        let mut system = build_system(SimConfig::default());
        let writer = TestClient::new();
        let peer = TestClient::new();
        let w = system.register_client(0, Box::new(writer.clone())).unwrap();
        system.register_client(0, Box::new(peer.clone())).unwrap();

        admit_write(&mut system, 0, w, 0x9000, &[0xAB], 3);
        drain(&mut system);

        let snoops = &peer.0.borrow().snoops;
        assert_eq!(snoops.len(), 1);
        assert_eq!(snoops[0].0, 0x9000);
        assert_eq!(snoops[0].1, vec![0xAB]);
        assert!(writer.0.borrow().snoops.is_empty(), "writer is not snooped");
    }

    #[test]
    fn test_buffered_writes_merge_and_ack_together() {
        let mut system = build_system(SimConfig::default());
        let client = TestClient::new();
        let c0 = system.register_client(0, Box::new(client.clone())).unwrap();

        // Seed a shared line so the write has to acquire tokens.
        let r1 = TestClient::new();
        let c1 = system.register_client(1, Box::new(r1)).unwrap();
        admit_read(&mut system, 0, c0, 0xA000);
        drain(&mut system);
        admit_read(&mut system, 1, c1, 0xA000);
        drain(&mut system);

        // Issue several writes back to back; later ones land in the
        // merge-store buffer while the first acquisition is in
        // flight.
        admit_write(&mut system, 0, c0, 0xA000, &[1], 10);
        admit_write(&mut system, 0, c0, 0xA008, &[2], 11);
        admit_write(&mut system, 0, c0, 0xA010, &[3], 12);
        drain(&mut system);

        let mut writes = client.0.borrow().writes.clone();
        writes.sort_unstable();
        assert_eq!(writes, vec![10, 11, 12]);

        let line = system.cache(0).probe(0xA000).expect("line on cache 0");
        assert_eq!(line.tokens, 4);
        assert_eq!(line.data[0], 1);
        assert_eq!(line.data[8], 2);
        assert_eq!(line.data[16], 3);
    }

    #[test]
    fn test_unaligned_and_crossing_requests_are_fatal() {
        let mut system = build_system(SimConfig::default());
        let c0 = system
            .register_client(0, Box::new(TestClient::new()))
            .unwrap();

        assert!(system.cache_read(0, c0, 0x1004).is_err());
        assert!(system.cache_write(0, c0, 0x103C, &[0u8; 8], 1).is_err());
        assert!(system.cache_write(0, c0, 0x1000, &[0u8; 65], 1).is_err());
    }

    #[test]
    fn test_interleaved_workload_drains_and_conserves_tokens() {
        let mut system = build_system(SimConfig {
            l2_cache_num_sets: 2,
            l2_cache_associativity: 2,
            ..SimConfig::default()
        });
        let clients: Vec<TestClient> = (0..4)
            .map(|cache| {
                let client = TestClient::new();
                system.register_client(cache, Box::new(client.clone())).unwrap();
                client
            })
            .collect();

        let addresses: [MemAddr; 6] = [0x0, 0x40, 0x80, 0x1000, 0x1040, 0x2080];
        let mut wid = 0u64;
        for round in 0..3 {
            for (i, &address) in addresses.iter().enumerate() {
                let cache = (round + i) % 4;
                if (round + i) % 2 == 0 {
                    admit_read(&mut system, cache, 0, address);
                } else {
                    wid += 1;
                    admit_write(&mut system, cache, 0, address, &[wid as u8, round as u8], wid);
                }
                // Let traffic overlap rather than serializing fully.
                system.run(3).unwrap();
            }
        }
        drain(&mut system);

        let acked: usize = clients.iter().map(|c| c.0.borrow().writes.len()).sum();
        assert_eq!(acked as u64, wid, "every admitted write was acknowledged");
    }
}
