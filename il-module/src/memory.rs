// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};

use crate::{MethodDef, Module, ProbeReference, StackEffect, Token};

/// In-memory module, built from its parts rather than parsed from an image.
#[derive(Clone, Debug, Default)]
pub struct MemoryModule {
    name: String,
    image: Vec<u8>,
    references: Vec<String>,
    methods: BTreeMap<Token, MethodDef>,
    member_refs: Vec<String>,
    effects: HashMap<Token, StackEffect>,
    probe: Option<(ProbeReference, Token)>,
    instrumented: bool,
}

impl MemoryModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_image(mut self, image: impl Into<Vec<u8>>) -> Self {
        self.image = image.into();
        self
    }

    pub fn add_reference(&mut self, assembly: impl Into<String>) {
        self.references.push(assembly.into());
    }

    /// Add a method definition with a header-prefixed body and return its token.
    pub fn add_method(
        &mut self,
        declaring_type: impl Into<String>,
        name: impl Into<String>,
        body: Option<Vec<u8>>,
    ) -> Token {
        let row = self.methods.len() as u32 + 1;
        let token = Token::new(Token::METHOD_DEF_TABLE, row);

        let method = MethodDef {
            token,
            declaring_type: declaring_type.into(),
            name: name.into(),
            body,
        };

        self.methods.insert(token, method);
        token
    }

    /// Add a member reference with a known call-site stack effect.
    pub fn add_member_ref(&mut self, name: impl Into<String>, effect: StackEffect) -> Token {
        self.member_refs.push(name.into());

        let token = Token::new(Token::MEMBER_REF_TABLE, self.member_refs.len() as u32);
        self.effects.insert(token, effect);
        token
    }

    pub fn method(&self, token: Token) -> Option<&MethodDef> {
        self.methods.get(&token)
    }
}

impl Module for MemoryModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn image(&self) -> &[u8] {
        &self.image
    }

    fn references(&self) -> Vec<String> {
        self.references.clone()
    }

    fn methods(&self) -> Vec<MethodDef> {
        self.methods.values().cloned().collect()
    }

    fn call_effect(&self, token: Token) -> Option<StackEffect> {
        self.effects.get(&token).copied()
    }

    fn import_probe(&mut self, probe: &ProbeReference) -> Result<Token> {
        if let Some((imported, token)) = &self.probe {
            if imported != probe {
                bail!(
                    "module {} already imports probe {}::{}",
                    self.name,
                    imported.type_name,
                    imported.method
                );
            }

            return Ok(*token);
        }

        let name = format!("[{}]{}::{}", probe.assembly, probe.type_name, probe.method);
        let token = self.add_member_ref(name, ProbeReference::EFFECT);

        if !self.references.contains(&probe.assembly) {
            self.references.push(probe.assembly.clone());
        }

        self.probe = Some((probe.clone(), token));
        Ok(token)
    }

    fn probe_token(&self) -> Option<Token> {
        self.probe.as_ref().map(|(_, token)| *token)
    }

    fn replace_body(&mut self, method: Token, body: Vec<u8>) -> Result<()> {
        match self.methods.get_mut(&method) {
            Some(def) => {
                def.body = Some(body);
                Ok(())
            }
            None => bail!("no method with token {:x} in module {}", method, self.name),
        }
    }

    fn is_instrumented(&self) -> bool {
        self.instrumented
    }

    fn mark_instrumented(&mut self) {
        self.instrumented = true;
    }
}
