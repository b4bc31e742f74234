//! A small, initially consistent fleet: one district of two nodes, owners
//! with one key each, applications whose gears draw UIDs from the district
//! and whose node reports list exactly the recorded keys.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use broker_rs::core::{
    AppId, Application, District, DistrictId, Domain, DomainId, Gear, GearId, GroupInstance,
    GroupInstanceId, KeySet, NodeId, Owner, OwnerId, SshKey, key_set,
};
use broker_rs::reconcile::{FileNodeAgent, NodeReport, Reconciler};
use broker_rs::store::{DocumentStore, MemoryStore, SqliteStore};
use tempfile::TempDir;

pub const FIRST_UID: u32 = 1000;
pub const CAPACITY: u32 = 20;
pub const NODES: [&str; 2] = ["node-1", "node-2"];

pub fn node(name: &str) -> NodeId {
    NodeId::new(name).expect("valid node id")
}

pub struct Fleet {
    pub store: Arc<dyn DocumentStore>,
    pub district: DistrictId,
    agent_dir: TempDir,
    reports: BTreeMap<NodeId, NodeReport>,
}

impl Fleet {
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn sqlite(path: &Path) -> Self {
        Self::with_store(Arc::new(SqliteStore::open(path).expect("open sqlite store")))
    }

    pub fn with_store(store: Arc<dyn DocumentStore>) -> Self {
        let mut district = District::new(DistrictId::generate(), "district-1", FIRST_UID, CAPACITY);
        district.server_identities = NODES.iter().map(|n| node(n)).collect();
        store.put_district(&district).expect("put district");

        let mut fleet = Self {
            store,
            district: district.id,
            agent_dir: TempDir::new().expect("agent dir"),
            reports: BTreeMap::new(),
        };
        for name in NODES {
            fleet.reports.insert(
                node(name),
                NodeReport {
                    node: node(name),
                    gears: BTreeMap::new(),
                },
            );
        }
        fleet.flush_reports();
        fleet
    }

    pub fn agent_dir(&self) -> &Path {
        self.agent_dir.path()
    }

    pub fn agent(&self) -> Arc<FileNodeAgent> {
        Arc::new(FileNodeAgent::new(self.agent_dir.path()))
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.store.clone(), self.agent())
    }

    /// Owner with a single personal key, plus one domain.
    pub fn owner(&mut self, login: &str) -> (Owner, Domain) {
        let owner = Owner {
            id: OwnerId::generate(),
            login: login.to_string(),
            consumed_gears: 0,
            max_gears: 100,
            ssh_keys: vec![SshKey::new(
                login,
                "ssh-ed25519",
                format!("AAAAC3{login}key {login}@laptop"),
            )],
        };
        let domain = Domain {
            id: DomainId::generate(),
            namespace: format!("{login}ns"),
            owner_id: owner.id,
            system_ssh_keys: Vec::new(),
        };
        self.store.put_owner(&owner).expect("put owner");
        self.store.put_domain(&domain).expect("put domain");
        (owner, domain)
    }

    /// Application with `gears` gears on `node_name`, UIDs taken from the
    /// district pool and the owner's counter bumped to match.
    pub fn app(
        &mut self,
        owner: &Owner,
        domain: &Domain,
        name: &str,
        gears: usize,
        node_name: &str,
    ) -> Application {
        let mut app = Application::new(AppId::generate(), name, owner.id, domain.id);
        let mut instance = GroupInstance {
            id: GroupInstanceId::generate(),
            gears: Vec::new(),
        };
        for _ in 0..gears {
            let uid = self.take_uid();
            instance.gears.push(Gear {
                id: GearId::generate(),
                uid,
                server_identity: node(node_name),
            });
        }
        app.group_instances.push(instance);
        self.store.put_application(&app).expect("put application");

        let current = self
            .store
            .find_owner(&owner.id)
            .expect("find owner")
            .expect("owner exists");
        self.store
            .set_consumed_gears(&owner.id, current.consumed_gears + gears as u32)
            .expect("bump counter");

        let keys = self.expected_keys(owner, &app);
        let report = self
            .reports
            .get_mut(&node(node_name))
            .expect("node belongs to fleet");
        for gear in app.gears() {
            report.gears.insert(gear.id, keys.clone());
        }
        self.flush_reports();
        app
    }

    pub fn expected_keys(&self, owner: &Owner, app: &Application) -> KeySet {
        key_set(owner.ssh_keys.iter().chain(app.ssh_keys.iter()))
    }

    /// Mutable view of what a node reports for one gear. Call
    /// [`Fleet::flush_reports`] afterwards.
    pub fn node_keys_mut(&mut self, node_name: &str, gear: &GearId) -> &mut KeySet {
        self.reports
            .get_mut(&node(node_name))
            .and_then(|report| report.gears.get_mut(gear))
            .expect("gear reported by node")
    }

    /// Drop a gear from its node's report, as if the node never heard of it.
    pub fn forget_gear(&mut self, node_name: &str, gear: &GearId) {
        self.reports
            .get_mut(&node(node_name))
            .and_then(|report| report.gears.remove(gear))
            .expect("gear reported by node");
        self.flush_reports();
    }

    pub fn flush_reports(&self) {
        let agent = FileNodeAgent::new(self.agent_dir.path());
        for report in self.reports.values() {
            agent.write_report(report).expect("write node report");
        }
    }

    /// Take a node offline by removing its report.
    pub fn silence(&mut self, node_name: &str) {
        let agent = FileNodeAgent::new(self.agent_dir.path());
        let path: PathBuf = agent.report_path(&node(node_name));
        std::fs::remove_file(path).expect("remove node report");
        self.reports.remove(&node(node_name));
    }

    pub fn district(&self) -> District {
        self.store
            .find_district(&self.district)
            .expect("find district")
            .expect("district exists")
    }

    fn take_uid(&self) -> u32 {
        let district = self.district();
        let uid = *district
            .available_uids
            .iter()
            .next()
            .expect("district has free uids");
        assert!(
            self.store
                .remove_available_uid(&self.district, uid)
                .expect("reserve uid")
        );
        uid
    }
}

/// Every live gear UID must be absent from its district's pool.
pub fn assert_no_live_uid_available(store: &dyn DocumentStore, district: &District) {
    store
        .scan_applications(broker_rs::store::AppProjection::Inventory, &mut |app| {
            for gear in app.gears() {
                if district.has_member(&gear.server_identity) {
                    assert!(
                        !district.is_available(gear.uid),
                        "uid {} of gear {} still listed available",
                        gear.uid,
                        gear.id
                    );
                }
            }
            Ok(())
        })
        .expect("scan applications");
}
