use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ColoniesError, Result};
use crate::model::{
    Attribute, Cron, Executor, Generator, GeneratorArg, Process, ProcessGraph, ProcessState,
};
use crate::store::{ProcessQuery, ProcessStore};

const DEFAULT_MAX_PROCESSES: usize = 100_000;

#[derive(Debug, Default)]
struct Tables {
    processes: HashMap<Uuid, Process>,
    /// Insertion sequence of processes and generator args, breaks ties
    /// between equal timestamps
    insert_seq: HashMap<Uuid, u64>,
    next_seq: u64,
    graphs: HashMap<Uuid, ProcessGraph>,
    generators: HashMap<Uuid, Generator>,
    generator_args: HashMap<Uuid, GeneratorArg>,
    crons: HashMap<Uuid, Cron>,
    executors: HashMap<Uuid, Executor>,
    attributes: HashMap<Uuid, Attribute>,
}

/// In-memory store used for single-node deployments and tests.
///
/// Several nodes may share one instance through an `Arc` to simulate a
/// cluster backed by a common database.
#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    max_processes: usize,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_PROCESSES)
    }

    pub fn with_capacity(max_processes: usize) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            max_processes,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails with a store error while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ColoniesError::Store("store unavailable".to_string()))
        }
    }
}

impl Tables {
    fn seq(&self, id: &Uuid) -> u64 {
        self.insert_seq.get(id).copied().unwrap_or(u64::MAX)
    }
}

fn limited<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        items.truncate(limit);
    }
    items
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn add_process(&self, process: Process) -> Result<()> {
        self.check()?;
        let mut t = self.tables.write().await;
        if t.processes.len() >= self.max_processes {
            return Err(ColoniesError::Store(format!(
                "process table at capacity ({})",
                self.max_processes
            )));
        }
        t.next_seq += 1;
        let seq = t.next_seq;
        t.insert_seq.insert(process.id, seq);
        t.processes.insert(process.id, process);
        Ok(())
    }

    async fn get_process(&self, id: &Uuid) -> Result<Option<Process>> {
        self.check()?;
        Ok(self.tables.read().await.processes.get(id).cloned())
    }

    async fn update_process(&self, process: &Process) -> Result<()> {
        self.check()?;
        let mut t = self.tables.write().await;
        match t.processes.get_mut(&process.id) {
            Some(existing) => {
                *existing = process.clone();
                Ok(())
            }
            None => Err(ColoniesError::ProcessNotFound(process.id)),
        }
    }

    async fn remove_process(&self, id: &Uuid) -> Result<()> {
        self.check()?;
        let mut t = self.tables.write().await;
        t.insert_seq.remove(id);
        let Tables {
            attributes,
            insert_seq,
            ..
        } = &mut *t;
        attributes.retain(|aid, a| {
            let keep = a.target_id != *id;
            if !keep {
                insert_seq.remove(aid);
            }
            keep
        });
        t.processes
            .remove(id)
            .map(|_| ())
            .ok_or(ColoniesError::ProcessNotFound(*id))
    }

    async fn find_processes(&self, query: &ProcessQuery) -> Result<Vec<Process>> {
        self.check()?;
        let t = self.tables.read().await;
        let mut found: Vec<Process> = t
            .processes
            .values()
            .filter(|p| query.matches(p))
            .cloned()
            .collect();
        found.sort_by_key(|p| (p.submitted_at, t.seq(&p.id)));
        Ok(limited(found, query.limit))
    }

    async fn find_candidates(&self, colony_name: &str, executor_type: &str) -> Result<Vec<Process>> {
        self.check()?;
        let t = self.tables.read().await;
        let mut found: Vec<Process> = t
            .processes
            .values()
            .filter(|p| {
                p.colony_name == colony_name
                    && p.is_eligible()
                    && p.spec.conditions.executor_type == executor_type
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.spec
                .priority
                .cmp(&a.spec.priority)
                .then(a.submitted_at.cmp(&b.submitted_at))
                .then(t.seq(&a.id).cmp(&t.seq(&b.id)))
        });
        Ok(found)
    }

    async fn colonies(&self) -> Result<Vec<String>> {
        self.check()?;
        let t = self.tables.read().await;
        let names: BTreeSet<String> = t
            .processes
            .values()
            .map(|p| p.colony_name.clone())
            .chain(t.graphs.values().map(|g| g.colony_name.clone()))
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn add_graph(&self, graph: ProcessGraph) -> Result<()> {
        self.check()?;
        self.tables.write().await.graphs.insert(graph.id, graph);
        Ok(())
    }

    async fn get_graph(&self, id: &Uuid) -> Result<Option<ProcessGraph>> {
        self.check()?;
        Ok(self.tables.read().await.graphs.get(id).cloned())
    }

    async fn update_graph(&self, graph: &ProcessGraph) -> Result<()> {
        self.check()?;
        let mut t = self.tables.write().await;
        match t.graphs.get_mut(&graph.id) {
            Some(existing) => {
                *existing = graph.clone();
                Ok(())
            }
            None => Err(ColoniesError::GraphNotFound(graph.id)),
        }
    }

    async fn remove_graph(&self, id: &Uuid) -> Result<()> {
        self.check()?;
        let mut t = self.tables.write().await;
        if t.graphs.remove(id).is_none() {
            return Err(ColoniesError::GraphNotFound(*id));
        }
        let Tables {
            processes,
            insert_seq,
            attributes,
            ..
        } = &mut *t;
        processes.retain(|pid, p| {
            let keep = p.graph_id != Some(*id);
            if !keep {
                insert_seq.remove(pid);
            }
            keep
        });
        attributes.retain(|aid, a| {
            let keep = processes.contains_key(&a.target_id);
            if !keep {
                insert_seq.remove(aid);
            }
            keep
        });
        Ok(())
    }

    async fn find_graphs(&self, colony_name: &str, limit: Option<usize>) -> Result<Vec<ProcessGraph>> {
        self.check()?;
        let t = self.tables.read().await;
        let mut found: Vec<ProcessGraph> = t
            .graphs
            .values()
            .filter(|g| g.colony_name == colony_name)
            .cloned()
            .collect();
        found.sort_by_key(|g| g.submitted_at);
        Ok(limited(found, limit))
    }

    async fn find_graph_by_key(&self, idempotency_key: &str) -> Result<Option<ProcessGraph>> {
        self.check()?;
        let t = self.tables.read().await;
        Ok(t.graphs
            .values()
            .find(|g| g.idempotency_key.as_deref() == Some(idempotency_key))
            .cloned())
    }

    async fn graph_members(&self, graph_id: &Uuid) -> Result<Vec<Process>> {
        self.check()?;
        let t = self.tables.read().await;
        let mut members: Vec<Process> = t
            .processes
            .values()
            .filter(|p| p.graph_id == Some(*graph_id))
            .cloned()
            .collect();
        members.sort_by_key(|p| (p.submitted_at, t.seq(&p.id)));
        Ok(members)
    }

    async fn add_generator(&self, generator: Generator) -> Result<()> {
        self.check()?;
        let mut t = self.tables.write().await;
        let taken = t
            .generators
            .values()
            .any(|g| g.colony_name == generator.colony_name && g.name == generator.name);
        if taken {
            return Err(ColoniesError::Store(format!(
                "generator {} already exists in colony {}",
                generator.name, generator.colony_name
            )));
        }
        t.generators.insert(generator.id, generator);
        Ok(())
    }

    async fn get_generator(&self, id: &Uuid) -> Result<Option<Generator>> {
        self.check()?;
        Ok(self.tables.read().await.generators.get(id).cloned())
    }

    async fn find_generator_by_name(&self, colony_name: &str, name: &str) -> Result<Option<Generator>> {
        self.check()?;
        let t = self.tables.read().await;
        Ok(t.generators
            .values()
            .find(|g| g.colony_name == colony_name && g.name == name)
            .cloned())
    }

    async fn update_generator(&self, generator: &Generator) -> Result<()> {
        self.check()?;
        let mut t = self.tables.write().await;
        match t.generators.get_mut(&generator.id) {
            Some(existing) => {
                *existing = generator.clone();
                Ok(())
            }
            None => Err(ColoniesError::GeneratorNotFound(generator.id.to_string())),
        }
    }

    async fn remove_generator(&self, id: &Uuid) -> Result<()> {
        self.check()?;
        let mut t = self.tables.write().await;
        if t.generators.remove(id).is_none() {
            return Err(ColoniesError::GeneratorNotFound(id.to_string()));
        }
        let Tables {
            generator_args,
            insert_seq,
            ..
        } = &mut *t;
        generator_args.retain(|aid, a| {
            let keep = a.generator_id != *id;
            if !keep {
                insert_seq.remove(aid);
            }
            keep
        });
        Ok(())
    }

    async fn find_generators(&self, colony_name: &str, limit: Option<usize>) -> Result<Vec<Generator>> {
        self.check()?;
        let t = self.tables.read().await;
        let mut found: Vec<Generator> = t
            .generators
            .values()
            .filter(|g| g.colony_name == colony_name)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(limited(found, limit))
    }

    async fn all_generators(&self) -> Result<Vec<Generator>> {
        self.check()?;
        Ok(self.tables.read().await.generators.values().cloned().collect())
    }

    async fn add_generator_arg(&self, arg: GeneratorArg) -> Result<()> {
        self.check()?;
        let mut t = self.tables.write().await;
        if !t.generators.contains_key(&arg.generator_id) {
            return Err(ColoniesError::GeneratorNotFound(arg.generator_id.to_string()));
        }
        t.next_seq += 1;
        let seq = t.next_seq;
        t.insert_seq.insert(arg.id, seq);
        t.generator_args.insert(arg.id, arg);
        Ok(())
    }

    async fn generator_args(&self, generator_id: &Uuid, limit: usize) -> Result<Vec<GeneratorArg>> {
        self.check()?;
        let t = self.tables.read().await;
        let mut args: Vec<GeneratorArg> = t
            .generator_args
            .values()
            .filter(|a| a.generator_id == *generator_id)
            .cloned()
            .collect();
        args.sort_by_key(|a| (a.added_at, t.seq(&a.id)));
        args.truncate(limit);
        Ok(args)
    }

    async fn remove_generator_args(&self, ids: &[Uuid]) -> Result<()> {
        self.check()?;
        let mut t = self.tables.write().await;
        for id in ids {
            t.generator_args.remove(id);
            t.insert_seq.remove(id);
        }
        Ok(())
    }

    async fn add_cron(&self, cron: Cron) -> Result<()> {
        self.check()?;
        let mut t = self.tables.write().await;
        let taken = t
            .crons
            .values()
            .any(|c| c.colony_name == cron.colony_name && c.name == cron.name);
        if taken {
            return Err(ColoniesError::Store(format!(
                "cron {} already exists in colony {}",
                cron.name, cron.colony_name
            )));
        }
        t.crons.insert(cron.id, cron);
        Ok(())
    }

    async fn get_cron(&self, id: &Uuid) -> Result<Option<Cron>> {
        self.check()?;
        Ok(self.tables.read().await.crons.get(id).cloned())
    }

    async fn find_cron_by_name(&self, colony_name: &str, name: &str) -> Result<Option<Cron>> {
        self.check()?;
        let t = self.tables.read().await;
        Ok(t.crons
            .values()
            .find(|c| c.colony_name == colony_name && c.name == name)
            .cloned())
    }

    async fn update_cron(&self, cron: &Cron) -> Result<()> {
        self.check()?;
        let mut t = self.tables.write().await;
        match t.crons.get_mut(&cron.id) {
            Some(existing) => {
                *existing = cron.clone();
                Ok(())
            }
            None => Err(ColoniesError::CronNotFound(cron.id.to_string())),
        }
    }

    async fn remove_cron(&self, id: &Uuid) -> Result<()> {
        self.check()?;
        self.tables
            .write()
            .await
            .crons
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ColoniesError::CronNotFound(id.to_string()))
    }

    async fn find_crons(&self, colony_name: &str, limit: Option<usize>) -> Result<Vec<Cron>> {
        self.check()?;
        let t = self.tables.read().await;
        let mut found: Vec<Cron> = t
            .crons
            .values()
            .filter(|c| c.colony_name == colony_name)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(limited(found, limit))
    }

    async fn all_crons(&self) -> Result<Vec<Cron>> {
        self.check()?;
        Ok(self.tables.read().await.crons.values().cloned().collect())
    }

    async fn add_attribute(&self, attribute: Attribute) -> Result<Attribute> {
        self.check()?;
        let mut t = self.tables.write().await;
        if let Some(existing) = t.attributes.values_mut().find(|a| a.same_slot(&attribute)) {
            existing.value = attribute.value;
            existing.added_at = attribute.added_at;
            return Ok(existing.clone());
        }
        t.next_seq += 1;
        let seq = t.next_seq;
        t.insert_seq.insert(attribute.id, seq);
        t.attributes.insert(attribute.id, attribute.clone());
        Ok(attribute)
    }

    async fn get_attribute(&self, id: &Uuid) -> Result<Option<Attribute>> {
        self.check()?;
        Ok(self.tables.read().await.attributes.get(id).cloned())
    }

    async fn process_attributes(&self, process_id: &Uuid) -> Result<Vec<Attribute>> {
        self.check()?;
        let t = self.tables.read().await;
        let mut found: Vec<Attribute> = t
            .attributes
            .values()
            .filter(|a| a.target_id == *process_id)
            .cloned()
            .collect();
        found.sort_by_key(|a| t.seq(&a.id));
        Ok(found)
    }

    async fn add_executor(&self, executor: Executor) -> Result<()> {
        self.check()?;
        self.tables.write().await.executors.insert(executor.id, executor);
        Ok(())
    }

    async fn get_executor(&self, id: &Uuid) -> Result<Option<Executor>> {
        self.check()?;
        Ok(self.tables.read().await.executors.get(id).cloned())
    }

    async fn update_executor(&self, executor: &Executor) -> Result<()> {
        self.check()?;
        let mut t = self.tables.write().await;
        match t.executors.get_mut(&executor.id) {
            Some(existing) => {
                *existing = executor.clone();
                Ok(())
            }
            None => Err(ColoniesError::ExecutorNotFound(executor.id)),
        }
    }

    async fn remove_executor(&self, id: &Uuid) -> Result<()> {
        self.check()?;
        self.tables
            .write()
            .await
            .executors
            .remove(id)
            .map(|_| ())
            .ok_or(ColoniesError::ExecutorNotFound(*id))
    }

    async fn find_executors(&self, colony_name: &str) -> Result<Vec<Executor>> {
        self.check()?;
        let t = self.tables.read().await;
        let mut found: Vec<Executor> = t
            .executors
            .values()
            .filter(|e| e.colony_name == colony_name)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn all_executors(&self) -> Result<Vec<Executor>> {
        self.check()?;
        Ok(self.tables.read().await.executors.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeKind, FunctionSpec, WorkflowSpec};
    use chrono::{Duration, Utc};

    fn process(colony: &str, executor_type: &str) -> Process {
        Process::new(FunctionSpec::new("n", "f", colony, executor_type))
    }

    #[tokio::test]
    async fn process_crud() {
        let store = MemoryStore::new();
        let mut p = process("dev", "cli");
        let id = p.id;
        store.add_process(p.clone()).await.unwrap();

        p.state = ProcessState::Running;
        store.update_process(&p).await.unwrap();
        assert_eq!(
            store.get_process(&id).await.unwrap().unwrap().state,
            ProcessState::Running
        );

        store.remove_process(&id).await.unwrap();
        assert!(store.get_process(&id).await.unwrap().is_none());
        assert!(matches!(
            store.remove_process(&id).await,
            Err(ColoniesError::ProcessNotFound(_))
        ));
    }

    #[tokio::test]
    async fn capacity_limit() {
        let store = MemoryStore::with_capacity(1);
        store.add_process(process("dev", "cli")).await.unwrap();
        assert!(matches!(
            store.add_process(process("dev", "cli")).await,
            Err(ColoniesError::Store(_))
        ));
    }

    #[tokio::test]
    async fn candidates_ordered_by_priority_then_age() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut old = process("dev", "cli");
        old.submitted_at = now - Duration::seconds(30);
        let mut young = process("dev", "cli");
        young.submitted_at = now - Duration::seconds(10);
        let mut urgent = process("dev", "cli");
        urgent.spec.priority = 5;
        urgent.submitted_at = now;
        let mut blocked = process("dev", "cli");
        blocked.wait_for_parents = true;
        let other_type = process("dev", "gpu");
        let other_colony = process("prod", "cli");

        let expected = vec![urgent.id, old.id, young.id];
        for p in [young, blocked, old, urgent, other_type, other_colony] {
            store.add_process(p).await.unwrap();
        }

        let ids: Vec<Uuid> = store
            .find_candidates("dev", "cli")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn remove_graph_cascades() {
        let store = MemoryStore::new();
        let graph = ProcessGraph::new("dev", None);
        let graph_id = graph.id;
        store.add_graph(graph).await.unwrap();

        let mut member = process("dev", "cli");
        member.graph_id = Some(graph_id);
        let member_id = member.id;
        let standalone = process("dev", "cli");
        let standalone_id = standalone.id;
        store.add_process(member).await.unwrap();
        store.add_process(standalone).await.unwrap();

        let attr = store
            .add_attribute(Attribute::new(member_id, AttributeKind::Out, "k", "v"))
            .await
            .unwrap();

        store.remove_graph(&graph_id).await.unwrap();
        assert!(store.graph_members(&graph_id).await.unwrap().is_empty());
        assert!(store.get_attribute(&attr.id).await.unwrap().is_none());
        assert!(store.get_process(&standalone_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn generator_args_oldest_first_and_removed_with_generator() {
        let store = MemoryStore::new();
        let generator = Generator::new("g", "dev", WorkflowSpec::new("dev"), 2, 0);
        let gid = generator.id;
        store.add_generator(generator).await.unwrap();

        let mut first = GeneratorArg::new(gid, "a");
        first.added_at = Utc::now() - Duration::seconds(5);
        store.add_generator_arg(GeneratorArg::new(gid, "b")).await.unwrap();
        store.add_generator_arg(first).await.unwrap();

        let args = store.generator_args(&gid, 1).await.unwrap();
        assert_eq!(args.len(), 1);
        assert_eq!(args[0].arg, "a");

        store.remove_generator(&gid).await.unwrap();
        assert!(store.generator_args(&gid, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_generator_name_rejected() {
        let store = MemoryStore::new();
        let wf = WorkflowSpec::new("dev");
        store
            .add_generator(Generator::new("g", "dev", wf.clone(), 1, 0))
            .await
            .unwrap();
        assert!(store
            .add_generator(Generator::new("g", "dev", wf, 1, 0))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn attribute_slot_replaced_and_removed_with_process() {
        let store = MemoryStore::new();
        let p = process("dev", "cli");
        let pid = p.id;
        store.add_process(p).await.unwrap();

        let first = store
            .add_attribute(Attribute::new(pid, AttributeKind::Out, "result", "1"))
            .await
            .unwrap();
        store
            .add_attribute(Attribute::new(pid, AttributeKind::Env, "result", "x"))
            .await
            .unwrap();
        let replaced = store
            .add_attribute(Attribute::new(pid, AttributeKind::Out, "result", "2"))
            .await
            .unwrap();
        assert_eq!(replaced.id, first.id);
        assert_eq!(
            store.get_attribute(&first.id).await.unwrap().unwrap().value,
            "2"
        );

        let all = store.process_attributes(&pid).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, AttributeKind::Out);

        store.remove_process(&pid).await.unwrap();
        assert!(store.get_attribute(&first.id).await.unwrap().is_none());
        assert!(store.process_attributes(&pid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.colonies().await, Err(ColoniesError::Store(_))));
        store.set_available(true);
        assert!(store.colonies().await.unwrap().is_empty());
    }
}
