//! Machine roles of an experiment and the client scaling actions.
//!
//! A fleet is one aggregator (monitoring), one server (the measured
//! service) and a variable set of clients spread over the configured
//! locations. With a private network configured, the server and the
//! clients at the network's location also get an interface on it.

use std::collections::BTreeMap;

use tracing::{error, info, warn};

use cumulus_core::{FleetConfig, MetricRegistrationConfig, PrivateNetworkConfig};
use cumulus_placement::{
    PlacementRegistry, aggregator_name, client_name, client_private_ip, private_network_name,
    server_name,
};
use cumulus_state::{
    ComputeResource, ComputeSpec, ContextValue, DiskKind, DiskSpec, Experiment, Location, Network,
    NetworkSpec, NicSpec, context_keys, metric_registration,
};

use crate::error::{SchedulerError, SchedulerResult};
use crate::provisioner::Provisioner;

/// The fixed machines of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Roles {
    pub aggregator: ComputeResource,
    pub server: ComputeResource,
}

impl Roles {
    pub fn all(&self) -> Vec<ComputeResource> {
        vec![self.aggregator.clone(), self.server.clone()]
    }
}

#[derive(Debug, Clone)]
struct PrivateNetwork {
    network: Network,
    config: PrivateNetworkConfig,
}

pub struct Fleet {
    provisioner: Provisioner,
    experiment: Experiment,
    config: FleetConfig,
    private: Option<PrivateNetwork>,
}

impl Fleet {
    /// Bind the fleet layout to `experiment`, creating the private network
    /// if one is configured.
    pub async fn prepare(
        provisioner: Provisioner,
        experiment: Experiment,
        config: FleetConfig,
    ) -> SchedulerResult<Self> {
        let private = match &config.private_network {
            Some(cfg) => {
                let location = provisioner.location(&cfg.location).await?;
                let spec = NetworkSpec {
                    name: private_network_name(&experiment.id),
                    location: location.id,
                    address: cfg.address.clone(),
                    size: cfg.size,
                    bandwidth: cfg.bandwidth,
                    latency: cfg.latency,
                    lossrate: cfg.lossrate,
                };
                let network = provisioner.find_or_create_network(&experiment, &spec).await?;
                Some(PrivateNetwork {
                    network,
                    config: cfg.clone(),
                })
            }
            None => None,
        };
        Ok(Self {
            provisioner,
            experiment,
            config,
            private,
        })
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    pub fn private_network(&self) -> Option<&Network> {
        self.private.as_ref().map(|p| &p.network)
    }

    /// Client locations, resolved in tie-break order.
    pub async fn client_locations(&self) -> SchedulerResult<Vec<Location>> {
        let mut locations = Vec::with_capacity(self.config.clients.locations.len());
        for name in &self.config.clients.locations {
            locations.push(self.provisioner.location(name).await?);
        }
        Ok(locations)
    }

    /// Registry holding the clients that already exist for this experiment.
    pub async fn rehydrate_registry(&self) -> SchedulerResult<PlacementRegistry> {
        let locations = self.client_locations().await?;
        if locations.is_empty() {
            return Err(SchedulerError::NoClientLocations);
        }
        Ok(PlacementRegistry::rehydrate(
            self.provisioner.repository().as_ref(),
            &self.experiment.id,
            locations,
        )
        .await?)
    }

    /// Find or create the aggregator, then the server pointing at it.
    pub async fn provision_roles(&self) -> SchedulerResult<Roles> {
        let role = &self.config.aggregator;
        let location = self.provisioner.location(&role.location).await?;
        let mut context = BTreeMap::new();
        insert_metric(&mut context, role.metric.as_ref());
        let spec = self
            .compute_spec(aggregator_name(&self.experiment.id), &location, &role.image, &role.instance_type, Vec::new(), context)
            .await?;
        let aggregator = self.provisioner.find_or_create_named(&self.experiment, &spec).await?;
        info!(name = %aggregator.name, ip = ?aggregator.primary_ip(), "aggregator provisioned");

        let role = &self.config.server;
        let location = self.provisioner.location(&role.location).await?;
        let mut context = BTreeMap::new();
        insert_aggregator_ip(&mut context, &aggregator);
        insert_metric(&mut context, role.metric.as_ref());
        let mut extra = Vec::new();
        if let Some(private) = self.private_at(&location) {
            extra.push(NicSpec {
                network: private.network.id.clone(),
                ip: Some(private.config.server_ip.clone()),
            });
        } else if self.private.is_some() {
            warn!(location = %location.name, "server is not at the private network's location");
        }
        let spec = self
            .compute_spec(server_name(&self.experiment.id), &location, &role.image, &role.instance_type, extra, context)
            .await?;
        let server = self.provisioner.find_or_create_named(&self.experiment, &spec).await?;
        info!(name = %server.name, ip = ?server.primary_ip(), "server provisioned");

        Ok(Roles { aggregator, server })
    }

    /// Find or create one client at the least-loaded location and record it.
    pub async fn provision_client(
        &self,
        registry: &mut PlacementRegistry,
        roles: &Roles,
    ) -> SchedulerResult<ComputeResource> {
        let location = registry
            .select_least_loaded()
            .cloned()
            .ok_or(SchedulerError::NoClientLocations)?;
        let ordinal = registry.next_ordinal();
        let name = client_name(&location.name, ordinal, &self.experiment.id);

        let mut context = BTreeMap::new();
        insert_aggregator_ip(&mut context, &roles.aggregator);
        if let Some(ip) = self.server_address(&roles.server) {
            context.insert(context_keys::IPERF_SERVER.to_string(), ContextValue::from(ip));
        }
        insert_metric(&mut context, self.config.clients.metric.as_ref());

        let mut extra = Vec::new();
        if let Some(private) = self.private_at(&location) {
            let ip = client_private_ip(&private.config.address, private.config.client_offset, ordinal)
                .ok_or(SchedulerError::AddressExhausted { ordinal })?;
            extra.push(NicSpec {
                network: private.network.id.clone(),
                ip: Some(ip),
            });
            context.insert(
                context_keys::PRIVATE_NETWORK.to_string(),
                ContextValue::from(private.network.id.as_str()),
            );
        }

        let clients = &self.config.clients;
        let spec = self
            .compute_spec(name, &location, &clients.image, &clients.instance_type, extra, context)
            .await?;
        let client = self.provisioner.find_or_create_named(&self.experiment, &spec).await?;
        info!(
            location = %location.name,
            client = %client.name,
            ip = ?client.primary_ip(),
            load = registry.count(&location.id) + 1,
            "client placed"
        );
        registry.assign(&location.id, client.clone());
        Ok(client)
    }

    /// Create the initial clients when the registry is empty.
    pub async fn ensure_initial_clients(
        &self,
        registry: &mut PlacementRegistry,
        roles: &Roles,
    ) -> SchedulerResult<Vec<ComputeResource>> {
        if !registry.is_empty() {
            info!(clients = registry.total(), "reusing existing clients");
            return Ok(Vec::new());
        }
        let mut created = Vec::new();
        for _ in 0..self.config.clients.initial {
            created.push(self.provision_client(registry, roles).await?);
        }
        Ok(created)
    }

    /// Remove the oldest client of the most-loaded location and destroy it.
    ///
    /// The victim leaves the registry even if destroying it fails; the
    /// failure is logged and the run goes on.
    pub async fn scale_down(&self, registry: &mut PlacementRegistry) -> Option<ComputeResource> {
        let victim = registry.select_most_loaded_victim()?;
        match self.provisioner.destroy(&victim).await {
            Ok(_) => {
                info!(client = %victim.name, location = %victim.location, remaining = registry.total(), "client removed");
            }
            Err(e) => {
                error!(client = %victim.name, error = %e, "failed to destroy client");
            }
        }
        Some(victim)
    }

    /// Address clients use to reach the server: its private address when
    /// it has one, otherwise its first address.
    pub fn server_address(&self, server: &ComputeResource) -> Option<String> {
        let private = self.private.as_ref().and_then(|p| {
            server
                .nic
                .iter()
                .find(|n| n.network == p.network.id)
                .and_then(|n| n.ip.clone())
        });
        private.or_else(|| server.primary_ip().map(str::to_string))
    }

    fn private_at(&self, location: &Location) -> Option<&PrivateNetwork> {
        self.private
            .as_ref()
            .filter(|p| p.network.location == location.id)
    }

    async fn compute_spec(
        &self,
        name: String,
        location: &Location,
        image: &str,
        instance_type: &str,
        extra_nics: Vec<NicSpec>,
        context: BTreeMap<String, ContextValue>,
    ) -> SchedulerResult<ComputeSpec> {
        let storage = self.provisioner.storage(location, image).await?;
        let wan = self.provisioner.network(location, &self.config.wan_network).await?;
        let mut nic = vec![NicSpec {
            network: wan.id,
            ip: None,
        }];
        nic.extend(extra_nics);
        Ok(ComputeSpec {
            name,
            instance_type: instance_type.to_string(),
            disk: vec![DiskSpec {
                storage: storage.id,
                kind: DiskKind::Os,
            }],
            nic,
            location: location.id.clone(),
            context,
        })
    }
}

fn insert_aggregator_ip(context: &mut BTreeMap<String, ContextValue>, aggregator: &ComputeResource) {
    match aggregator.primary_ip() {
        Some(ip) => {
            context.insert(context_keys::AGGREGATOR_IP.to_string(), ContextValue::from(ip));
        }
        None => warn!(aggregator = %aggregator.name, "aggregator has no address yet"),
    }
}

fn insert_metric(context: &mut BTreeMap<String, ContextValue>, metric: Option<&MetricRegistrationConfig>) {
    if let Some(m) = metric {
        context.insert(
            context_keys::METRICS.to_string(),
            metric_registration(&m.name, &m.command),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_core::{ClientsConfig, RoleConfig};
    use cumulus_state::{ExperimentSpec, ExperimentStatus, ResourceRepository, StateStore};
    use std::sync::Arc;

    const SITES: [&str; 3] = ["uk-epcc", "be-ibbt", "fr-inria"];

    fn role(location: &str, image: &str) -> RoleConfig {
        RoleConfig {
            location: location.to_string(),
            image: image.to_string(),
            instance_type: "small".to_string(),
            metric: None,
        }
    }

    fn fleet_config(private: bool) -> FleetConfig {
        FleetConfig {
            wan_network: "WAN".to_string(),
            aggregator: role("uk-epcc", "zabbix"),
            server: RoleConfig {
                metric: Some(MetricRegistrationConfig {
                    name: "iperf.server-bw".to_string(),
                    command: "cat /tmp/bw".to_string(),
                }),
                ..role("uk-epcc", "debian-7")
            },
            clients: ClientsConfig {
                locations: SITES.iter().map(|s| s.to_string()).collect(),
                image: "debian-7".to_string(),
                instance_type: "small".to_string(),
                initial: 2,
                metric: None,
            },
            private_network: private.then(|| PrivateNetworkConfig {
                location: "uk-epcc".to_string(),
                address: "192.168.0.0".to_string(),
                size: 24,
                bandwidth: 100,
                latency: 0,
                lossrate: 0,
                server_ip: "192.168.0.2".to_string(),
                client_offset: 3,
            }),
        }
    }

    async fn fleet(private: bool) -> (Arc<StateStore>, Fleet) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        for (i, site) in SITES.iter().enumerate() {
            store.seed_location(site).unwrap();
            store.seed_storage(site, "debian-7").unwrap();
            store.seed_storage(site, "zabbix").unwrap();
            store.seed_network(site, "WAN", Some(format!("172.18.{i}.0").as_str())).unwrap();
        }
        let exp = store
            .submit_experiment(&ExperimentSpec {
                name: "scaling".to_string(),
                description: String::new(),
                status: ExperimentStatus::Running,
                walltime: 3600,
            })
            .await
            .unwrap();
        let fleet = Fleet::prepare(Provisioner::new(store.clone()), exp, fleet_config(private))
            .await
            .unwrap();
        (store, fleet)
    }

    #[tokio::test]
    async fn roles_are_found_not_duplicated() {
        let (store, fleet) = fleet(false).await;
        let first = fleet.provision_roles().await.unwrap();
        let second = fleet.provision_roles().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list_computes().unwrap().len(), 2);
        assert_eq!(first.aggregator.name, "BonFIRE-monitor-experiment1");
        assert_eq!(first.server.name, "server-experiment1");
    }

    #[tokio::test]
    async fn server_context_points_at_aggregator() {
        let (_, fleet) = fleet(false).await;
        let roles = fleet.provision_roles().await.unwrap();
        let aggregator_ip = roles.aggregator.primary_ip().unwrap();
        assert_eq!(
            roles.server.context[context_keys::AGGREGATOR_IP].as_str(),
            aggregator_ip
        );
        assert_eq!(
            roles.server.context[context_keys::METRICS].as_str(),
            "<metric>iperf.server-bw,cat /tmp/bw</metric>"
        );
    }

    #[tokio::test]
    async fn initial_clients_spread_over_locations() {
        let (_, fleet) = fleet(false).await;
        let roles = fleet.provision_roles().await.unwrap();
        let mut registry = fleet.rehydrate_registry().await.unwrap();
        let created = fleet.ensure_initial_clients(&mut registry, &roles).await.unwrap();

        let names: Vec<&str> = created.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["uk-epcc-0-client-e1", "be-ibbt-1-client-e1"]);
        assert_eq!(registry.total(), 2);
        assert_eq!(
            created[0].context[context_keys::IPERF_SERVER].as_str(),
            roles.server.primary_ip().unwrap()
        );

        // A restarted run rediscovers them instead of creating more.
        let mut again = fleet.rehydrate_registry().await.unwrap();
        assert!(fleet.ensure_initial_clients(&mut again, &roles).await.unwrap().is_empty());
        assert_eq!(again.total(), 2);
        assert_eq!(again.next_ordinal(), 2);
    }

    #[tokio::test]
    async fn scale_down_destroys_oldest_of_busiest_location() {
        let (store, fleet) = fleet(false).await;
        let roles = fleet.provision_roles().await.unwrap();
        let mut registry = fleet.rehydrate_registry().await.unwrap();
        for _ in 0..4 {
            fleet.provision_client(&mut registry, &roles).await.unwrap();
        }
        // uk-epcc holds ordinals 0 and 3.
        let victim = fleet.scale_down(&mut registry).await.unwrap();
        assert_eq!(victim.name, "uk-epcc-0-client-e1");
        assert_eq!(registry.total(), 3);
        assert!(store.list_computes().unwrap().iter().all(|c| c.id != victim.id));
    }

    #[tokio::test]
    async fn scale_down_survives_missing_victim() {
        let (_, fleet) = fleet(false).await;
        let roles = fleet.provision_roles().await.unwrap();
        let mut registry = fleet.rehydrate_registry().await.unwrap();
        let client = fleet.provision_client(&mut registry, &roles).await.unwrap();
        fleet.provisioner().destroy(&client).await.unwrap();

        let victim = fleet.scale_down(&mut registry).await.unwrap();
        assert_eq!(victim.id, client.id);
        assert!(registry.is_empty());
        assert!(fleet.scale_down(&mut registry).await.is_none());
    }

    #[tokio::test]
    async fn private_network_interfaces() {
        let (store, fleet) = fleet(true).await;
        let private = fleet.private_network().cloned().unwrap();
        assert_eq!(private.name, "network-experiment1");

        let roles = fleet.provision_roles().await.unwrap();
        assert_eq!(roles.server.nic.len(), 2);
        assert_eq!(roles.server.nic[1].ip.as_deref(), Some("192.168.0.2"));
        assert_eq!(fleet.server_address(&roles.server).as_deref(), Some("192.168.0.2"));

        let mut registry = fleet.rehydrate_registry().await.unwrap();
        let local = fleet.provision_client(&mut registry, &roles).await.unwrap();
        let remote = fleet.provision_client(&mut registry, &roles).await.unwrap();

        assert_eq!(local.location, "uk-epcc");
        assert_eq!(local.nic[1].ip.as_deref(), Some("192.168.0.3"));
        assert_eq!(local.context[context_keys::PRIVATE_NETWORK].as_str(), private.id);
        assert_eq!(local.context[context_keys::IPERF_SERVER].as_str(), "192.168.0.2");

        assert_eq!(remote.location, "be-ibbt");
        assert_eq!(remote.nic.len(), 1);
        assert!(!remote.context.contains_key(context_keys::PRIVATE_NETWORK));

        // Preparing again reuses the network.
        let exp = fleet.experiment().clone();
        let again = Fleet::prepare(Provisioner::new(store.clone()), exp.clone(), fleet_config(true))
            .await
            .unwrap();
        assert_eq!(again.private_network().map(|n| n.id.clone()), Some(private.id));
        assert_eq!(store.experiment_networks(&exp.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_client_location_is_fatal() {
        let (_, fleet) = fleet(false).await;
        let mut config = fleet_config(false);
        config.clients.locations.push("nowhere".to_string());
        let bad = Fleet::prepare(fleet.provisioner().clone(), fleet.experiment().clone(), config)
            .await
            .unwrap();
        assert!(matches!(
            bad.rehydrate_registry().await,
            Err(SchedulerError::LocationNotFound(name)) if name == "nowhere"
        ));
    }
}
