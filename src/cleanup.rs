//! Teardown of everything setup created
//!
//! Order matters: collaborators hold references to sub-agent aliases, and
//! agents cannot be deleted while aliases exist. Each step is attempted even
//! when an earlier one failed; the [`CleanupReport`] says what happened.

use crate::aws::AwsContext;
use crate::config::{AgentSettings, KitConfig, WaitSettings};
use crate::poll::{settle, wait_for_deletion};
use crate::provision::agents::DRAFT_VERSION;
use crate::provision::iam::RoleManager;
use crate::provision::knowledge_base::KnowledgeBaseManager;
use crate::provision::lambda;
use crate::Result;
use async_trait::async_trait;
use aws_sdk_bedrockagent::Client;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Agent id and name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasRef {
    pub id: String,
    pub name: String,
}

/// A collaborator association on one version of a supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaborationRef {
    pub collaborator_id: String,
    pub name: String,
    pub version: String,
}

/// Action group on an agent's draft version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionGroupRef {
    pub id: String,
    pub name: String,
}

/// Read access to the agents in an account
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn list_agents(&self) -> Result<Vec<AgentRef>>;
    /// Numbered versions only; `DRAFT` is added by [`find_all_versions`]
    async fn list_versions(&self, agent_id: &str) -> Result<Vec<String>>;
    async fn list_aliases(&self, agent_id: &str) -> Result<Vec<AliasRef>>;
    async fn list_collaborators(&self, agent_id: &str, version: &str) -> Result<Vec<CollaborationRef>>;
}

#[async_trait]
impl AgentDirectory for Client {
    async fn list_agents(&self) -> Result<Vec<AgentRef>> {
        let mut agents = Vec::new();
        let mut paginator = Client::list_agents(self).into_paginator().send();
        while let Some(page) = paginator.next().await {
            let page = page?;
            agents.extend(page.agent_summaries.into_iter().map(|agent| AgentRef {
                id: agent.agent_id,
                name: agent.agent_name,
            }));
        }
        Ok(agents)
    }

    async fn list_versions(&self, agent_id: &str) -> Result<Vec<String>> {
        let mut versions = Vec::new();
        let mut paginator = self
            .list_agent_versions()
            .agent_id(agent_id)
            .into_paginator()
            .send();
        while let Some(page) = paginator.next().await {
            let page = page?;
            versions.extend(
                page.agent_version_summaries
                    .into_iter()
                    .map(|version| version.agent_version),
            );
        }
        Ok(versions)
    }

    async fn list_aliases(&self, agent_id: &str) -> Result<Vec<AliasRef>> {
        let mut aliases = Vec::new();
        let mut paginator = self
            .list_agent_aliases()
            .agent_id(agent_id)
            .into_paginator()
            .send();
        while let Some(page) = paginator.next().await {
            let page = page?;
            aliases.extend(page.agent_alias_summaries.into_iter().map(|alias| AliasRef {
                id: alias.agent_alias_id,
                name: alias.agent_alias_name,
            }));
        }
        Ok(aliases)
    }

    async fn list_collaborators(&self, agent_id: &str, version: &str) -> Result<Vec<CollaborationRef>> {
        let output = self
            .list_agent_collaborators()
            .agent_id(agent_id)
            .agent_version(version)
            .send()
            .await?;
        Ok(output
            .agent_collaborator_summaries
            .into_iter()
            .map(|collaborator| CollaborationRef {
                collaborator_id: collaborator.collaborator_id,
                name: collaborator.collaborator_name,
                version: version.to_string(),
            })
            .collect())
    }
}

/// The deletes the agent teardown issues
#[async_trait]
pub trait AgentTeardown: AgentDirectory {
    async fn disassociate(&self, agent_id: &str, version: &str, collaborator_id: &str) -> Result<()>;
    async fn remove_alias(&self, agent_id: &str, alias_id: &str) -> Result<()>;
    /// Action groups of the draft version
    async fn action_groups(&self, agent_id: &str) -> Result<Vec<ActionGroupRef>>;
    async fn remove_action_group(&self, agent_id: &str, action_group_id: &str) -> Result<()>;
    async fn remove_agent(&self, agent_id: &str) -> Result<()>;
    /// Not-found once the agent is gone
    async fn agent_status(&self, agent_id: &str) -> Result<String>;
}

#[async_trait]
impl AgentTeardown for Client {
    async fn disassociate(&self, agent_id: &str, version: &str, collaborator_id: &str) -> Result<()> {
        self.disassociate_agent_collaborator()
            .agent_id(agent_id)
            .agent_version(version)
            .collaborator_id(collaborator_id)
            .send()
            .await?;
        Ok(())
    }

    async fn remove_alias(&self, agent_id: &str, alias_id: &str) -> Result<()> {
        self.delete_agent_alias()
            .agent_id(agent_id)
            .agent_alias_id(alias_id)
            .send()
            .await?;
        Ok(())
    }

    async fn action_groups(&self, agent_id: &str) -> Result<Vec<ActionGroupRef>> {
        let mut groups = Vec::new();
        let mut paginator = self
            .list_agent_action_groups()
            .agent_id(agent_id)
            .agent_version(DRAFT_VERSION)
            .into_paginator()
            .send();
        while let Some(page) = paginator.next().await {
            let page = page?;
            groups.extend(page.action_group_summaries.into_iter().map(|group| ActionGroupRef {
                id: group.action_group_id,
                name: group.action_group_name,
            }));
        }
        Ok(groups)
    }

    async fn remove_action_group(&self, agent_id: &str, action_group_id: &str) -> Result<()> {
        self.delete_agent_action_group()
            .agent_id(agent_id)
            .agent_version(DRAFT_VERSION)
            .action_group_id(action_group_id)
            .send()
            .await?;
        Ok(())
    }

    async fn remove_agent(&self, agent_id: &str) -> Result<()> {
        self.delete_agent().agent_id(agent_id).send().await?;
        Ok(())
    }

    async fn agent_status(&self, agent_id: &str) -> Result<String> {
        let output = self.get_agent().agent_id(agent_id).send().await?;
        Ok(output
            .agent
            .map(|a| a.agent_status.as_str().to_string())
            .unwrap_or_default())
    }
}

/// Split `arn:aws:bedrock:<region>:<account>:agent-alias/<agent id>/<alias id>`
pub fn parse_alias_arn(alias_arn: &str) -> Option<(String, String)> {
    let mut parts = alias_arn.split('/');
    let prefix = parts.next()?;
    if !prefix.starts_with("arn:") {
        return None;
    }
    let agent_id = parts.next().filter(|s| !s.is_empty())?;
    let mut alias_id = parts.next().filter(|s| !s.is_empty())?;
    // Older `agent/<id>/alias/<alias id>` form
    if alias_id == "alias" {
        alias_id = parts.next().filter(|s| !s.is_empty())?;
    }
    Some((agent_id.to_string(), alias_id.to_string()))
}

/// Orchestrator and sub-agents matched by their configured names
pub fn select_specific_agents(
    agents: &[AgentRef],
    orchestrator_name: &str,
    sub_agent_names: &[&str],
) -> (Option<AgentRef>, Vec<AgentRef>) {
    let orchestrator = agents.iter().find(|a| a.name == orchestrator_name).cloned();
    let sub_agents = agents
        .iter()
        .filter(|a| sub_agent_names.contains(&a.name.as_str()))
        .cloned()
        .collect();
    (orchestrator, sub_agents)
}

/// Every version of an agent, `DRAFT` first
pub async fn find_all_versions<D: AgentDirectory + ?Sized>(directory: &D, agent_id: &str) -> Vec<String> {
    let mut versions = vec![DRAFT_VERSION.to_string()];
    match directory.list_versions(agent_id).await {
        Ok(found) => versions.extend(found.into_iter().filter(|v| v != DRAFT_VERSION)),
        Err(err) => warn!(agent_id, error = %err, "Could not list agent versions"),
    }
    debug!(agent_id, versions = ?versions, "Agent versions");
    versions
}

/// Collaborations across every version of a supervisor
pub async fn find_all_collaborations<D: AgentDirectory + ?Sized>(
    directory: &D,
    orchestrator_id: &str,
) -> Vec<CollaborationRef> {
    let mut collaborations = Vec::new();
    for version in find_all_versions(directory, orchestrator_id).await {
        match directory.list_collaborators(orchestrator_id, &version).await {
            Ok(found) => collaborations.extend(found),
            Err(err) => warn!(
                orchestrator_id,
                version = %version,
                error = %err,
                "Could not list collaborators"
            ),
        }
    }
    collaborations
}

/// Any agent (other than the sub-agents) that uses one of them as collaborator
pub async fn find_any_orchestrator<D: AgentDirectory + ?Sized>(
    directory: &D,
    agents: &[AgentRef],
    sub_agent_names: &[&str],
) -> Option<AgentRef> {
    for agent in agents {
        if sub_agent_names.contains(&agent.name.as_str()) {
            continue;
        }
        let collaborations = find_all_collaborations(directory, &agent.id).await;
        if let Some(hit) = collaborations
            .iter()
            .find(|c| sub_agent_names.contains(&c.name.as_str()))
        {
            info!(
                orchestrator = %agent.name,
                orchestrator_id = %agent.id,
                collaborator = %hit.name,
                "Found orchestrator through its collaborators"
            );
            return Some(agent.clone());
        }
    }
    None
}

/// Completed and failed teardown steps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub completed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn record<T>(&mut self, step: impl Into<String>, result: Result<T>) -> Option<T> {
        let step = step.into();
        match result {
            Ok(value) => {
                debug!(step = %step, "Cleanup step done");
                self.completed.push(step);
                Some(value)
            }
            Err(err) => {
                warn!(step = %step, error = %err, "Cleanup step failed");
                self.failed.push((step, err.to_string()));
                None
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Fold a later pass into this report
    ///
    /// Each step keeps its latest outcome, so a failure that a later pass
    /// completed no longer counts.
    pub fn merge(&mut self, later: CleanupReport) {
        self.failed.retain(|(step, _)| {
            !later.completed.contains(step) && !later.failed.iter().any(|(failed, _)| failed == step)
        });
        self.completed.retain(|step| !later.failed.iter().any(|(failed, _)| failed == step));
        for step in later.completed {
            if !self.completed.contains(&step) {
                self.completed.push(step);
            }
        }
        self.failed.extend(later.failed);
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} steps completed, {} failed", self.completed.len(), self.failed.len())?;
        for (step, error) in &self.failed {
            writeln!(f, "  FAILED {}: {}", step, error)?;
        }
        Ok(())
    }
}

pub struct BedrockAgentCleanup<'a> {
    aws: &'a AwsContext,
    config: &'a KitConfig,
    bucket: String,
    delete_bucket: bool,
}

impl<'a> BedrockAgentCleanup<'a> {
    pub fn new(aws: &'a AwsContext, config: &'a KitConfig, bucket: impl Into<String>, delete_bucket: bool) -> Self {
        Self {
            aws,
            config,
            bucket: bucket.into(),
            delete_bucket,
        }
    }

    fn agents_client(&self) -> Client {
        self.aws.bedrock_agent()
    }

    /// One full teardown pass
    pub async fn run(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let client = self.agents_client();
        teardown_agents(&client, &self.config.agents, &self.config.waits, &mut report).await;

        let function_name = &self.config.lambda.function_name;
        let result = lambda::delete_function(&self.aws.lambda(), function_name).await;
        report.record(format!("delete function {}", function_name), result);

        let roles = RoleManager::new(self.aws.iam(), Duration::ZERO);
        match self.aws.account_id().await {
            Ok(account_id) => {
                let kb_manager = KnowledgeBaseManager::new(
                    client.clone(),
                    self.aws.s3(),
                    &roles,
                    &self.config.knowledge_base,
                    &self.config.waits,
                    self.aws.region(),
                    account_id,
                );
                let result = kb_manager.delete(&self.bucket, self.delete_bucket, true).await;
                report.record(format!("delete knowledge base {}", self.config.knowledge_base.name), result);
            }
            Err(err) => {
                report.record::<()>("resolve account id", Err(err));
            }
        }

        for role in [&self.config.agents.role_name, &self.config.lambda.role_name] {
            let result = roles.delete_role(role).await;
            report.record(format!("delete role {}", role), result);
        }

        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            "Cleanup pass finished"
        );
        report
    }

    /// Run `passes` full passes; later passes pick up what earlier ones left behind
    pub async fn run_passes(&self, passes: usize) -> CleanupReport {
        let mut report = CleanupReport::default();
        for pass in 1..=passes {
            info!(pass, "Starting cleanup pass");
            report.merge(self.run().await);
            if pass < passes {
                info!("Making sure the sub-agents are deleted");
            }
        }
        report
    }
}

/// Empty when the agent is already gone
fn unless_missing<T>(result: Result<Vec<T>>) -> Result<Vec<T>> {
    match result {
        Err(err) if err.is_not_found() => Ok(Vec::new()),
        other => other,
    }
}

async fn delete_all_aliases<T: AgentTeardown + ?Sized>(
    api: &T,
    agent: &AgentRef,
    waits: &WaitSettings,
    report: &mut CleanupReport,
) {
    let listed = unless_missing(api.list_aliases(&agent.id).await);
    let Some(aliases) = report.record(format!("list aliases of {}", agent.name), listed) else {
        return;
    };

    for alias in &aliases {
        info!(agent = %agent.name, alias = %alias.name, alias_id = %alias.id, "Deleting agent alias");
        let result = api.remove_alias(&agent.id, &alias.id).await;
        report.record(format!("delete alias {} of {}", alias.name, agent.name), result);
    }

    if !aliases.is_empty() {
        settle(waits.alias_delete_settle, "alias deletion").await;
    }
}

async fn delete_action_groups<T: AgentTeardown + ?Sized>(api: &T, agent: &AgentRef, report: &mut CleanupReport) {
    let listed = unless_missing(api.action_groups(&agent.id).await);
    let Some(groups) = report.record(format!("list action groups of {}", agent.name), listed) else {
        return;
    };

    for group in groups {
        info!(agent = %agent.name, action_group = %group.name, "Deleting action group");
        let result = api.remove_action_group(&agent.id, &group.id).await;
        report.record(format!("delete action group {} of {}", group.name, agent.name), result);
    }
}

/// Delete and wait until the agent is gone; already deleted counts as done
async fn delete_agent<T: AgentTeardown + ?Sized>(api: &T, agent: &AgentRef, waits: &WaitSettings) -> Result<()> {
    info!(agent = %agent.name, agent_id = %agent.id, "Deleting agent");
    match api.remove_agent(&agent.id).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {
            debug!(agent = %agent.name, "Agent already deleted");
            return Ok(());
        }
        Err(err) => return Err(err),
    }

    let agent_id = agent.id.as_str();
    wait_for_deletion(
        &format!("agent {} to be deleted", agent.name),
        waits.poll_interval,
        waits.poll_timeout,
        || api.agent_status(agent_id),
    )
    .await?;
    info!(agent = %agent.name, "Agent deleted");
    Ok(())
}

/// Remove the configured orchestrator and sub-agents
///
/// Collaborators are disassociated before any alias goes, aliases before
/// action groups, and sub-agents are deleted before the orchestrator.
pub async fn teardown_agents<T: AgentTeardown + ?Sized>(
    api: &T,
    agents_config: &AgentSettings,
    waits: &WaitSettings,
    report: &mut CleanupReport,
) {
    let sub_agent_names = agents_config.sub_agent_names();

    let agents = report.record("list agents", api.list_agents().await).unwrap_or_default();
    let (mut orchestrator, sub_agents) =
        select_specific_agents(&agents, &agents_config.orchestrator.name, &sub_agent_names);
    if orchestrator.is_none() {
        info!(
            name = %agents_config.orchestrator.name,
            "Orchestrator not found by name, looking for any supervisor of the sub-agents"
        );
        orchestrator = find_any_orchestrator(api, &agents, &sub_agent_names).await;
    }

    if let Some(orchestrator) = &orchestrator {
        let collaborations = find_all_collaborations(api, &orchestrator.id).await;
        for collaboration in &collaborations {
            info!(
                orchestrator = %orchestrator.name,
                collaborator = %collaboration.name,
                version = %collaboration.version,
                "Disassociating collaborator"
            );
            let result = api
                .disassociate(&orchestrator.id, &collaboration.version, &collaboration.collaborator_id)
                .await;
            report.record(
                format!(
                    "disassociate {} from {} ({})",
                    collaboration.name, orchestrator.name, collaboration.version
                ),
                result,
            );
        }
        if !collaborations.is_empty() {
            settle(waits.disassociate_settle, "collaborator disassociation").await;
        }

        delete_all_aliases(api, orchestrator, waits, report).await;
    }

    for sub_agent in &sub_agents {
        delete_all_aliases(api, sub_agent, waits, report).await;
    }
    for sub_agent in &sub_agents {
        delete_action_groups(api, sub_agent, report).await;
    }
    for sub_agent in &sub_agents {
        let result = delete_agent(api, sub_agent, waits).await;
        report.record(format!("delete agent {}", sub_agent.name), result);
    }
    if let Some(orchestrator) = &orchestrator {
        let result = delete_agent(api, orchestrator, waits).await;
        report.record(format!("delete agent {}", orchestrator.name), result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KitError;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    fn agent(id: &str, name: &str) -> AgentRef {
        AgentRef {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    #[derive(Default)]
    struct FakeDirectory {
        agents: Vec<AgentRef>,
        versions: HashMap<String, Vec<String>>,
        collaborators: HashMap<(String, String), Vec<String>>,
    }

    #[async_trait]
    impl AgentDirectory for FakeDirectory {
        async fn list_agents(&self) -> Result<Vec<AgentRef>> {
            Ok(self.agents.clone())
        }

        async fn list_versions(&self, agent_id: &str) -> Result<Vec<String>> {
            match self.versions.get(agent_id) {
                Some(versions) => Ok(versions.clone()),
                None => Err(KitError::resource_not_found(agent_id.to_string())),
            }
        }

        async fn list_aliases(&self, _agent_id: &str) -> Result<Vec<AliasRef>> {
            Ok(Vec::new())
        }

        async fn list_collaborators(&self, agent_id: &str, version: &str) -> Result<Vec<CollaborationRef>> {
            Ok(self
                .collaborators
                .get(&(agent_id.to_string(), version.to_string()))
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(i, name)| CollaborationRef {
                    collaborator_id: format!("C{}", i),
                    name,
                    version: version.to_string(),
                })
                .collect())
        }
    }

    #[test]
    fn test_parse_alias_arn() {
        assert_eq!(
            parse_alias_arn("arn:aws:bedrock:us-east-1:123456789012:agent-alias/AGENT123/ALIAS456"),
            Some(("AGENT123".to_string(), "ALIAS456".to_string()))
        );
        assert_eq!(
            parse_alias_arn("arn:aws:bedrock:us-east-1:123456789012:agent/AGENT123/alias/ALIAS456"),
            Some(("AGENT123".to_string(), "ALIAS456".to_string()))
        );
        assert_eq!(parse_alias_arn(""), None);
        assert_eq!(parse_alias_arn("arn:aws:bedrock:us-east-1:1:agent/AGENT123"), None);
        assert_eq!(parse_alias_arn("not-an-arn/a/b"), None);
    }

    #[test]
    fn test_select_specific_agents() {
        let agents = vec![
            agent("O1", "OrchestratorAgent2"),
            agent("A1", "Agent1"),
            agent("X1", "Unrelated"),
            agent("A2", "Agent2"),
        ];
        let (orchestrator, subs) =
            select_specific_agents(&agents, "OrchestratorAgent2", &["Agent1", "Agent2"]);
        assert_eq!(orchestrator, Some(agent("O1", "OrchestratorAgent2")));
        assert_eq!(subs, vec![agent("A1", "Agent1"), agent("A2", "Agent2")]);
    }

    #[tokio::test]
    async fn test_versions_always_include_draft() {
        let mut directory = FakeDirectory::default();
        directory
            .versions
            .insert("O1".to_string(), vec!["1".to_string(), "DRAFT".to_string(), "2".to_string()]);
        assert_eq!(find_all_versions(&directory, "O1").await, vec!["DRAFT", "1", "2"]);
        assert_eq!(find_all_versions(&directory, "missing").await, vec!["DRAFT"]);
    }

    #[tokio::test]
    async fn test_find_any_orchestrator_checks_every_version() {
        let mut directory = FakeDirectory {
            agents: vec![
                agent("A1", "Agent1"),
                agent("X1", "Unrelated"),
                agent("S1", "RenamedSupervisor"),
            ],
            ..Default::default()
        };
        directory.versions.insert("X1".to_string(), vec![]);
        directory.versions.insert("S1".to_string(), vec!["1".to_string()]);
        directory
            .collaborators
            .insert(("X1".to_string(), "DRAFT".to_string()), vec!["SomeoneElse".to_string()]);
        directory
            .collaborators
            .insert(("S1".to_string(), "1".to_string()), vec!["Agent2".to_string()]);

        let agents = directory.list_agents().await.unwrap();
        let found = find_any_orchestrator(&directory, &agents, &["Agent1", "Agent2"]).await;
        assert_eq!(found, Some(agent("S1", "RenamedSupervisor")));

        let collaborations = find_all_collaborations(&directory, "S1").await;
        assert_eq!(collaborations.len(), 1);
        assert_eq!(collaborations[0].version, "1");
    }

    #[tokio::test]
    async fn test_find_any_orchestrator_skips_sub_agents() {
        let mut directory = FakeDirectory {
            agents: vec![agent("A1", "Agent1")],
            ..Default::default()
        };
        directory
            .collaborators
            .insert(("A1".to_string(), "DRAFT".to_string()), vec!["Agent2".to_string()]);
        let agents = directory.list_agents().await.unwrap();
        assert_eq!(find_any_orchestrator(&directory, &agents, &["Agent1", "Agent2"]).await, None);
    }

    #[test]
    fn test_report_records_and_continues() {
        let mut report = CleanupReport::default();
        assert_eq!(report.record("delete alias", Ok(7)), Some(7));
        assert_eq!(
            report.record::<()>("delete agent", Err(KitError::conflict("alias still in use"))),
            None
        );
        assert!(!report.is_clean());
        assert_eq!(report.completed, vec!["delete alias"]);
        let rendered = report.to_string();
        assert!(rendered.contains("1 steps completed, 1 failed"));
        assert!(rendered.contains("FAILED delete agent"));
    }
    #[test]
    fn test_merge_keeps_latest_outcome_per_step() {
        let mut first = CleanupReport::default();
        first.record::<()>("list agents", Ok(()));
        first.record::<()>("delete agent Agent1", Err(KitError::conflict("alias still in use")));
        first.record::<()>("delete role AgentRole", Ok(()));

        let mut second = CleanupReport::default();
        second.record::<()>("list agents", Ok(()));
        second.record::<()>("delete agent Agent1", Ok(()));
        second.record::<()>("delete role AgentRole", Err(KitError::AccessDenied {
            message: "iam:DeleteRole".to_string(),
        }));

        first.merge(second);
        assert_eq!(first.completed, vec!["list agents", "delete agent Agent1"]);
        assert_eq!(first.failed.len(), 1);
        assert_eq!(first.failed[0].0, "delete role AgentRole");
    }

    /// An account whose deletes enforce the service's ordering rules
    ///
    /// Listing stays stale after deletes, the way eventual consistency makes
    /// a second pass see agents that are already gone.
    #[derive(Default)]
    struct FakeAccount {
        agents: Vec<AgentRef>,
        /// Collaborator agent ids per supervisor
        collaborators: Mutex<HashMap<String, Vec<AgentRef>>>,
        aliases: Mutex<HashMap<String, Vec<AliasRef>>>,
        action_groups: Mutex<HashMap<String, Vec<ActionGroupRef>>>,
        deleted: Mutex<HashSet<String>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeAccount {
        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn take_calls(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }

        fn missing(&self, agent_id: &str) -> Result<()> {
            if self.deleted.lock().unwrap().contains(agent_id) {
                return Err(KitError::resource_not_found(format!("agent {}", agent_id)));
            }
            Ok(())
        }

        fn is_collaborator(&self, agent_id: &str) -> bool {
            self.collaborators
                .lock()
                .unwrap()
                .values()
                .any(|collaborators| collaborators.iter().any(|c| c.id == agent_id))
        }
    }

    #[async_trait]
    impl AgentDirectory for FakeAccount {
        async fn list_agents(&self) -> Result<Vec<AgentRef>> {
            Ok(self.agents.clone())
        }

        async fn list_versions(&self, agent_id: &str) -> Result<Vec<String>> {
            self.missing(agent_id)?;
            Ok(Vec::new())
        }

        async fn list_aliases(&self, agent_id: &str) -> Result<Vec<AliasRef>> {
            self.missing(agent_id)?;
            Ok(self.aliases.lock().unwrap().get(agent_id).cloned().unwrap_or_default())
        }

        async fn list_collaborators(&self, agent_id: &str, version: &str) -> Result<Vec<CollaborationRef>> {
            self.missing(agent_id)?;
            Ok(self
                .collaborators
                .lock()
                .unwrap()
                .get(agent_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|collaborator| CollaborationRef {
                    collaborator_id: collaborator.id,
                    name: collaborator.name,
                    version: version.to_string(),
                })
                .collect())
        }
    }

    #[async_trait]
    impl AgentTeardown for FakeAccount {
        async fn disassociate(&self, agent_id: &str, version: &str, collaborator_id: &str) -> Result<()> {
            self.log(format!("disassociate {} {} {}", agent_id, version, collaborator_id));
            if let Some(collaborators) = self.collaborators.lock().unwrap().get_mut(agent_id) {
                collaborators.retain(|c| c.id != collaborator_id);
            }
            Ok(())
        }

        async fn remove_alias(&self, agent_id: &str, alias_id: &str) -> Result<()> {
            self.log(format!("delete alias {} {}", agent_id, alias_id));
            if self.is_collaborator(agent_id) {
                return Err(KitError::conflict("alias is referenced by a supervisor"));
            }
            if let Some(aliases) = self.aliases.lock().unwrap().get_mut(agent_id) {
                aliases.retain(|alias| alias.id != alias_id);
            }
            Ok(())
        }

        async fn action_groups(&self, agent_id: &str) -> Result<Vec<ActionGroupRef>> {
            self.missing(agent_id)?;
            Ok(self.action_groups.lock().unwrap().get(agent_id).cloned().unwrap_or_default())
        }

        async fn remove_action_group(&self, agent_id: &str, action_group_id: &str) -> Result<()> {
            self.log(format!("delete action group {} {}", agent_id, action_group_id));
            if let Some(groups) = self.action_groups.lock().unwrap().get_mut(agent_id) {
                groups.retain(|group| group.id != action_group_id);
            }
            Ok(())
        }

        async fn remove_agent(&self, agent_id: &str) -> Result<()> {
            self.log(format!("delete agent {}", agent_id));
            self.missing(agent_id)?;
            let has_aliases = self.aliases.lock().unwrap().get(agent_id).is_some_and(|a| !a.is_empty());
            if has_aliases {
                return Err(KitError::conflict("agent still has aliases"));
            }
            self.deleted.lock().unwrap().insert(agent_id.to_string());
            Ok(())
        }

        async fn agent_status(&self, agent_id: &str) -> Result<String> {
            self.missing(agent_id)?;
            Ok("DELETING".to_string())
        }
    }

    fn instant_waits() -> WaitSettings {
        WaitSettings {
            collaborator_settle: Duration::ZERO,
            disassociate_settle: Duration::ZERO,
            alias_delete_settle: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
            ..WaitSettings::default()
        }
    }

    fn alias(id: &str, name: &str) -> AliasRef {
        AliasRef {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_teardown_order_across_two_passes() {
        let settings = AgentSettings::default();
        let orchestrator = agent("O1", &settings.orchestrator.name);
        let first = agent("A1", &settings.sub_agents[0].name);
        let second = agent("A2", &settings.sub_agents[1].name);
        let account = FakeAccount {
            agents: vec![orchestrator.clone(), first.clone(), second.clone()],
            ..Default::default()
        };
        account
            .collaborators
            .lock()
            .unwrap()
            .insert("O1".to_string(), vec![first.clone(), second.clone()]);
        {
            let mut aliases = account.aliases.lock().unwrap();
            aliases.insert("O1".to_string(), vec![alias("OA", "orchestrator-alias")]);
            aliases.insert("A1".to_string(), vec![alias("AA1", "agent1-alias")]);
            aliases.insert("A2".to_string(), vec![alias("AA2", "agent2-alias")]);
        }
        account.action_groups.lock().unwrap().insert(
            "A1".to_string(),
            vec![ActionGroupRef {
                id: "G1".to_string(),
                name: "RetrieveDocuments".to_string(),
            }],
        );
        let waits = instant_waits();

        let mut report = CleanupReport::default();
        teardown_agents(&account, &settings, &waits, &mut report).await;
        assert!(report.is_clean(), "{}", report);
        assert_eq!(
            account.take_calls(),
            vec![
                "disassociate O1 DRAFT A1",
                "disassociate O1 DRAFT A2",
                "delete alias O1 OA",
                "delete alias A1 AA1",
                "delete alias A2 AA2",
                "delete action group A1 G1",
                "delete agent A1",
                "delete agent A2",
                "delete agent O1",
            ]
        );

        let mut second_pass = CleanupReport::default();
        teardown_agents(&account, &settings, &waits, &mut second_pass).await;
        assert!(second_pass.is_clean(), "{}", second_pass);
        assert_eq!(
            account.take_calls(),
            vec!["delete agent A1", "delete agent A2", "delete agent O1"]
        );
        assert!(second_pass.completed.contains(&format!("delete agent {}", first.name)));

        report.merge(second_pass);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_teardown_reports_out_of_order_failures() {
        let settings = AgentSettings::default();
        let sub_agent = agent("A1", &settings.sub_agents[0].name);
        let supervisor = agent("S1", "SomeOtherSupervisor");
        let account = FakeAccount {
            agents: vec![sub_agent.clone()],
            ..Default::default()
        };
        // A supervisor outside the listing still holds the sub-agent
        account
            .collaborators
            .lock()
            .unwrap()
            .insert(supervisor.id.clone(), vec![sub_agent.clone()]);
        account
            .aliases
            .lock()
            .unwrap()
            .insert("A1".to_string(), vec![alias("AA1", "agent1-alias")]);

        let mut report = CleanupReport::default();
        teardown_agents(&account, &settings, &instant_waits(), &mut report).await;

        let failed: Vec<&str> = report.failed.iter().map(|(step, _)| step.as_str()).collect();
        assert_eq!(
            failed,
            vec![
                format!("delete alias agent1-alias of {}", sub_agent.name),
                format!("delete agent {}", sub_agent.name),
            ]
        );
        assert_eq!(account.take_calls(), vec!["delete alias A1 AA1", "delete agent A1"]);
    }
}
