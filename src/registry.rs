//! Static agent registry with validated dependency resolution
//!
//! Agents declare which other agents must have completed before they may run.
//! The registry validates the declarations at construction (unique ids, known
//! dependencies, acyclic graph, a single orchestrator that covers every
//! analyzer) and precomputes a stable topological execution order, so step
//! numbering is reproducible across every run built from the same registry.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Role of an agent within a correction run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Analyzes one aspect of the submission (grammar, cohesion, ...)
    Analyzer,
    /// Consumes every analyzer's output and produces the final feedback
    Orchestrator,
}

/// Static definition of one analysis agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier, referenced by pipeline steps and templates
    pub id: String,
    /// Human-readable label shown to operators
    pub name: String,
    pub description: String,
    pub role: AgentRole,
    /// Agent ids that must have completed before this agent may run
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Registry misconfiguration, fatal at startup and never raised per-run
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("Duplicate agent id: {0}")]
    DuplicateAgent(String),
    #[error("Agent '{agent}' depends on unknown agent '{dependency}'")]
    MissingDependency { agent: String, dependency: String },
    #[error("Dependency cycle involving agents: {remaining:?}")]
    Cycle { remaining: Vec<String> },
    #[error("Registry must define exactly one orchestrator, found {count}")]
    OrchestratorCount { count: usize },
    #[error("Orchestrator does not depend (transitively) on analyzer '{agent}'")]
    UncoveredAnalyzer { agent: String },
}

/// Validated set of agents with a precomputed execution order
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: Vec<Agent>,
    /// Indices into `agents`, in execution order
    order: Vec<usize>,
}

impl AgentRegistry {
    /// Build a registry from agent declarations, validating all invariants
    pub fn new(agents: Vec<Agent>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for agent in &agents {
            if !seen.insert(agent.id.as_str()) {
                return Err(RegistryError::DuplicateAgent(agent.id.clone()));
            }
        }
        for agent in &agents {
            for dep in &agent.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(RegistryError::MissingDependency {
                        agent: agent.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let order = topological_order(&agents)?;
        let registry = Self { agents, order };
        registry.validate_orchestrator()?;
        Ok(registry)
    }

    /// The stock manual-correction chain: grammar, cohesion, theme, then the
    /// final-feedback orchestrator over all three.
    pub fn manual_correction() -> Self {
        let agents = vec![
            Agent {
                id: "grammar-analysis".to_string(),
                name: "Grammar Analysis".to_string(),
                description: "Identifies grammatical and orthographic issues in the submission"
                    .to_string(),
                role: AgentRole::Analyzer,
                depends_on: vec![],
            },
            Agent {
                id: "cohesion-analysis".to_string(),
                name: "Cohesion Analysis".to_string(),
                description: "Evaluates textual cohesion, building on the grammar findings"
                    .to_string(),
                role: AgentRole::Analyzer,
                depends_on: vec!["grammar-analysis".to_string()],
            },
            Agent {
                id: "theme-analysis".to_string(),
                name: "Theme Analysis".to_string(),
                description: "Checks adherence to the assigned theme and question".to_string(),
                role: AgentRole::Analyzer,
                depends_on: vec!["cohesion-analysis".to_string()],
            },
            Agent {
                id: "final-feedback".to_string(),
                name: "Final Feedback".to_string(),
                description: "Consolidates all analyses into operator-facing feedback"
                    .to_string(),
                role: AgentRole::Orchestrator,
                depends_on: vec![
                    "grammar-analysis".to_string(),
                    "cohesion-analysis".to_string(),
                    "theme-analysis".to_string(),
                ],
            },
        ];

        // The stock chain is validated by tests; construction cannot fail.
        Self::new(agents).expect("stock manual correction registry is valid")
    }

    /// Agents in execution order: every agent appears after all of its
    /// dependencies, ties broken by declaration order.
    pub fn execution_order(&self) -> Vec<&Agent> {
        self.order.iter().map(|&i| &self.agents[i]).collect()
    }

    /// Look up an agent by id
    pub fn get(&self, id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// All agents in declaration order
    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    fn validate_orchestrator(&self) -> Result<(), RegistryError> {
        let orchestrators: Vec<&Agent> = self
            .agents
            .iter()
            .filter(|a| a.role == AgentRole::Orchestrator)
            .collect();
        if orchestrators.len() != 1 {
            return Err(RegistryError::OrchestratorCount {
                count: orchestrators.len(),
            });
        }

        // Transitive closure of the orchestrator's dependencies
        let by_id: HashMap<&str, &Agent> =
            self.agents.iter().map(|a| (a.id.as_str(), a)).collect();
        let mut covered: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = orchestrators[0]
            .depends_on
            .iter()
            .map(String::as_str)
            .collect();
        while let Some(id) = stack.pop() {
            if covered.insert(id) {
                if let Some(agent) = by_id.get(id) {
                    stack.extend(agent.depends_on.iter().map(String::as_str));
                }
            }
        }

        for agent in &self.agents {
            if agent.role == AgentRole::Analyzer && !covered.contains(agent.id.as_str()) {
                return Err(RegistryError::UncoveredAnalyzer {
                    agent: agent.id.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Kahn's algorithm with declaration-order tie-breaking
fn topological_order(agents: &[Agent]) -> Result<Vec<usize>, RegistryError> {
    let index_of: HashMap<&str, usize> = agents
        .iter()
        .enumerate()
        .map(|(i, a)| (a.id.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; agents.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); agents.len()];
    for (i, agent) in agents.iter().enumerate() {
        for dep in &agent.depends_on {
            let d = index_of[dep.as_str()];
            indegree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut order = Vec::with_capacity(agents.len());
    let mut placed = vec![false; agents.len()];
    while order.len() < agents.len() {
        // Lowest declaration index among ready agents keeps the sort stable
        let next = (0..agents.len()).find(|&i| !placed[i] && indegree[i] == 0);
        match next {
            Some(i) => {
                placed[i] = true;
                order.push(i);
                for &dep in &dependents[i] {
                    indegree[dep] -= 1;
                }
            }
            None => {
                let remaining: Vec<String> = agents
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !placed[*i])
                    .map(|(_, a)| a.id.clone())
                    .collect();
                return Err(RegistryError::Cycle { remaining });
            }
        }
    }
    Ok(order)
}
