// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identifier-keyed tables resolving the references between events.
//!
//! Events refer to each other by opaque identifier: a test case names its
//! pickle, a pickle names its document and scenario, and so on. These tables
//! are rebuilt for every run and only ever grow. Every accessor returns a
//! [`LookupError`] on a miss; whether that is fatal is up to the caller.

use crate::errors::{LookupError, LookupKind};
use indexmap::IndexMap;
use scenario_relay_metadata::events::{
    Background, DocumentStep, GherkinDocument, Pickle, Scenario, TestCase, TestStep,
};
use std::collections::HashMap;

/// A test case attempt that has started and not yet been handed off.
#[derive(Clone, Debug)]
pub struct StartedCase {
    /// The compiled test case this attempt runs.
    pub test_case_id: String,
    /// Index of the record in the report's test cases.
    pub record_index: usize,
    /// Pickle step id → index of its step record.
    pub step_indices: IndexMap<String, usize>,
}

/// The lookup tables for one run.
#[derive(Debug, Default)]
pub struct LookupTables {
    documents: HashMap<String, GherkinDocument>,
    document_steps: HashMap<String, DocumentStep>,
    scenarios: HashMap<String, Scenario>,
    pickles: HashMap<String, Pickle>,
    test_cases: HashMap<String, TestCase>,
    test_steps: HashMap<String, TestStep>,
    started: HashMap<String, StartedCase>,
}

impl LookupTables {
    /// Creates empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes a document, its scenarios and all of its steps, including those
    /// under backgrounds and rules.
    pub fn insert_document(&mut self, document: GherkinDocument) {
        if let Some(feature) = &document.feature {
            for child in &feature.children {
                if let Some(background) = &child.background {
                    self.index_background(background);
                }
                if let Some(scenario) = &child.scenario {
                    self.index_scenario(scenario);
                }
                if let Some(rule) = &child.rule {
                    for rule_child in &rule.children {
                        if let Some(background) = &rule_child.background {
                            self.index_background(background);
                        }
                        if let Some(scenario) = &rule_child.scenario {
                            self.index_scenario(scenario);
                        }
                    }
                }
            }
        }
        self.documents.insert(document.uri.clone(), document);
    }

    fn index_background(&mut self, background: &Background) {
        for step in &background.steps {
            self.document_steps.insert(step.id.clone(), step.clone());
        }
    }

    fn index_scenario(&mut self, scenario: &Scenario) {
        for step in &scenario.steps {
            self.document_steps.insert(step.id.clone(), step.clone());
        }
        self.scenarios.insert(scenario.id.clone(), scenario.clone());
    }

    /// Indexes a pickle.
    pub fn insert_pickle(&mut self, pickle: Pickle) {
        self.pickles.insert(pickle.id.clone(), pickle);
    }

    /// Indexes a test case and each of its steps.
    pub fn insert_test_case(&mut self, test_case: TestCase) {
        for step in &test_case.test_steps {
            self.test_steps.insert(step.id.clone(), step.clone());
        }
        self.test_cases.insert(test_case.id.clone(), test_case);
    }

    /// Records a started test case attempt.
    pub fn insert_started(&mut self, started_id: impl Into<String>, started: StartedCase) {
        self.started.insert(started_id.into(), started);
    }

    /// Removes a started test case attempt once it has finished.
    pub fn remove_started(&mut self, started_id: &str) -> Result<StartedCase, LookupError> {
        self.started
            .remove(started_id)
            .ok_or_else(|| LookupError::new(LookupKind::TestCaseStarted, started_id))
    }

    /// Returns the document with the given URI.
    pub fn document(&self, uri: &str) -> Result<&GherkinDocument, LookupError> {
        self.documents
            .get(uri)
            .ok_or_else(|| LookupError::new(LookupKind::Document, uri))
    }

    /// Returns the document step with the given AST node id.
    pub fn document_step(&self, id: &str) -> Result<&DocumentStep, LookupError> {
        self.document_steps
            .get(id)
            .ok_or_else(|| LookupError::new(LookupKind::DocumentStep, id))
    }

    /// Returns the scenario with the given AST node id.
    pub fn scenario(&self, id: &str) -> Result<&Scenario, LookupError> {
        self.scenarios
            .get(id)
            .ok_or_else(|| LookupError::new(LookupKind::Scenario, id))
    }

    /// Returns the pickle with the given id.
    pub fn pickle(&self, id: &str) -> Result<&Pickle, LookupError> {
        self.pickles
            .get(id)
            .ok_or_else(|| LookupError::new(LookupKind::Pickle, id))
    }

    /// Returns the test case with the given id.
    pub fn test_case(&self, id: &str) -> Result<&TestCase, LookupError> {
        self.test_cases
            .get(id)
            .ok_or_else(|| LookupError::new(LookupKind::TestCase, id))
    }

    /// Returns the test step with the given id.
    pub fn test_step(&self, id: &str) -> Result<&TestStep, LookupError> {
        self.test_steps
            .get(id)
            .ok_or_else(|| LookupError::new(LookupKind::TestStep, id))
    }

    /// Returns the started attempt with the given id.
    pub fn started(&self, started_id: &str) -> Result<&StartedCase, LookupError> {
        self.started
            .get(started_id)
            .ok_or_else(|| LookupError::new(LookupKind::TestCaseStarted, started_id))
    }
}
