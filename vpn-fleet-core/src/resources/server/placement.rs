use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
        PodAffinity, PodAffinityTerm, PodAntiAffinity, ResourceRequirements, Toleration,
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, LabelSelectorRequirement},
    },
};

use crate::resources::crd::v1alpha1::vpnserver::{
    ResourceList, ServerAffinity, ServerLabelSelector, ServerNodeAffinity,
    ServerPodAffinityTerm, ServerResources, ServerToleration,
};

// Declared placement is handed to the pods as-is, only the shapes change.

impl ServerResources {
    pub fn to_requirements(&self) -> ResourceRequirements {
        ResourceRequirements {
            limits: self.limits.as_ref().map(ResourceList::to_quantities),
            requests: self.requests.as_ref().map(ResourceList::to_quantities),
            ..Default::default()
        }
    }
}

impl ResourceList {
    fn to_quantities(&self) -> BTreeMap<String, Quantity> {
        [("cpu", &self.cpu), ("memory", &self.memory)]
            .into_iter()
            .filter_map(|(name, value)| {
                value
                    .as_ref()
                    .map(|value| (name.to_owned(), Quantity(value.to_owned())))
            })
            .collect()
    }
}

impl ServerToleration {
    pub fn to_toleration(&self) -> Toleration {
        Toleration {
            key: self.key.to_owned(),
            operator: self.operator.to_owned(),
            value: self.value.to_owned(),
            effect: self.effect.to_owned(),
            ..Default::default()
        }
    }
}

impl ServerAffinity {
    pub fn to_affinity(&self) -> Affinity {
        Affinity {
            node_affinity: self.node_affinity.as_ref().map(ServerNodeAffinity::to_node_affinity),
            pod_affinity: self.pod_affinity.as_ref().map(|affinity| PodAffinity {
                required_during_scheduling_ignored_during_execution: affinity
                    .required_during_scheduling_ignored_during_execution
                    .as_ref()
                    .map(|terms| terms.iter().map(ServerPodAffinityTerm::to_term).collect()),
                ..Default::default()
            }),
            pod_anti_affinity: self.pod_anti_affinity.as_ref().map(|affinity| PodAntiAffinity {
                required_during_scheduling_ignored_during_execution: affinity
                    .required_during_scheduling_ignored_during_execution
                    .as_ref()
                    .map(|terms| terms.iter().map(ServerPodAffinityTerm::to_term).collect()),
                ..Default::default()
            }),
        }
    }
}

impl ServerNodeAffinity {
    fn to_node_affinity(&self) -> NodeAffinity {
        NodeAffinity {
            required_during_scheduling_ignored_during_execution: self
                .required_during_scheduling_ignored_during_execution
                .as_ref()
                .map(|selector| NodeSelector {
                    node_selector_terms: selector
                        .node_selector_terms
                        .iter()
                        .map(|term| NodeSelectorTerm {
                            match_expressions: term.match_expressions.as_ref().map(|expressions| {
                                expressions
                                    .iter()
                                    .map(|requirement| NodeSelectorRequirement {
                                        key: requirement.key.to_owned(),
                                        operator: requirement.operator.to_owned(),
                                        values: requirement.values.to_owned(),
                                    })
                                    .collect()
                            }),
                            ..Default::default()
                        })
                        .collect(),
                }),
            ..Default::default()
        }
    }
}

impl ServerPodAffinityTerm {
    fn to_term(&self) -> PodAffinityTerm {
        PodAffinityTerm {
            label_selector: self.label_selector.as_ref().map(ServerLabelSelector::to_selector),
            namespaces: self.namespaces.to_owned(),
            topology_key: self.topology_key.to_owned(),
            ..Default::default()
        }
    }
}

impl ServerLabelSelector {
    fn to_selector(&self) -> LabelSelector {
        LabelSelector {
            match_labels: self.match_labels.to_owned(),
            match_expressions: self.match_expressions.as_ref().map(|expressions| {
                expressions
                    .iter()
                    .map(|requirement| LabelSelectorRequirement {
                        key: requirement.key.to_owned(),
                        operator: requirement.operator.to_owned(),
                        values: requirement.values.to_owned(),
                    })
                    .collect()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::resources::crd::v1alpha1::vpnserver::{
        ResourceList, SelectorRequirement, ServerAffinity, ServerLabelSelector,
        ServerNodeAffinity, ServerNodeSelector, ServerNodeSelectorTerm, ServerPodAffinity,
        ServerPodAffinityTerm, ServerResources,
    };

    #[test]
    fn resources_skip_unset_quantities() {
        let resources = ServerResources {
            limits: Some(ResourceList {
                cpu: Some("500m".to_owned()),
                memory: None,
            }),
            requests: None,
        };

        let requirements = resources.to_requirements();
        let limits = requirements.limits.unwrap();

        assert_eq!(limits.len(), 1);
        assert_eq!(limits["cpu"].0, "500m");
        assert!(requirements.requests.is_none());
    }

    #[test]
    fn affinity_is_passed_through() {
        let requirement = SelectorRequirement {
            key: "kubernetes.io/arch".to_owned(),
            operator: "In".to_owned(),
            values: Some(vec!["amd64".to_owned()]),
        };
        let affinity = ServerAffinity {
            node_affinity: Some(ServerNodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(ServerNodeSelector {
                    node_selector_terms: vec![ServerNodeSelectorTerm {
                        match_expressions: Some(vec![requirement]),
                    }],
                }),
            }),
            pod_affinity: None,
            pod_anti_affinity: Some(ServerPodAffinity {
                required_during_scheduling_ignored_during_execution: Some(vec![
                    ServerPodAffinityTerm {
                        label_selector: Some(ServerLabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                "vpn-fleet.dev/server".to_owned(),
                                "edge".to_owned(),
                            )])),
                            match_expressions: None,
                        }),
                        namespaces: None,
                        topology_key: "kubernetes.io/hostname".to_owned(),
                    },
                ]),
            }),
        };

        let converted = affinity.to_affinity();
        let node_terms = converted
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        let anti_terms = converted
            .pod_anti_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap();

        assert_eq!(node_terms[0].match_expressions.as_ref().unwrap()[0].operator, "In");
        assert_eq!(anti_terms[0].topology_key, "kubernetes.io/hostname");
        assert!(converted.pod_affinity.is_none());
    }
}
