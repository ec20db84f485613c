// Copyright (C) 2023 QuerentAI LLC.
// This file is part of Querent.

// The Licensed Work is licensed under the Business Source License 1.1 (BSL 1.1).
// You may use this file in compliance with the BSL 1.1, subject to the following restrictions:
// 1. You may not use the Licensed Work for AI-related services, database services,
//    or any service or product offering that provides database, big data, or analytics
//    services to third parties unless explicitly authorized by QuerentAI LLC.
// 2. For more details, see the LICENSE file or visit https://mariadb.com/bsl11/.

// For inquiries about alternative licensing arrangements, please contact contact@querent.xyz.

// The Licensed Work is provided "AS IS", WITHOUT WARRANTY OF ANY KIND, express or implied,
// including but not limited to the warranties of merchantability, fitness for a particular purpose,
// and non-infringement. See the Business Source License for more details.

// This software includes code developed by QuerentAI LLC (https://querent.xyz).

use serde::{Deserialize, Serialize};

/// An external AI service subject to rate limits. Immutable, drawn from a fixed set.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Provider {
	Openai,
	Anthropic,
	Perplexity,
}

impl Provider {
	pub const ALL: [Provider; 3] = [Provider::Openai, Provider::Anthropic, Provider::Perplexity];
}

impl std::fmt::Display for Provider {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			Provider::Openai => "OPENAI",
			Provider::Anthropic => "ANTHROPIC",
			Provider::Perplexity => "PERPLEXITY",
		};
		write!(f, "{s}")
	}
}

/// A class of agent; maps 1:1 to a logical task type. Each kind has a declared
/// preferred [`Provider`]. Immutable.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentKind {
	PaperProcessor,
	ContentSummariser,
	QualityChecker,
	CitationFormatter,
	MetadataEnhancer,
	ResearchAgent,
}

impl AgentKind {
	pub const ALL: [AgentKind; 6] = [
		AgentKind::PaperProcessor,
		AgentKind::ContentSummariser,
		AgentKind::QualityChecker,
		AgentKind::CitationFormatter,
		AgentKind::MetadataEnhancer,
		AgentKind::ResearchAgent,
	];

	/// The provider this kind of agent is routed to by default.
	pub fn preferred_provider(&self) -> Provider {
		match self {
			AgentKind::PaperProcessor => Provider::Openai,
			AgentKind::ContentSummariser => Provider::Anthropic,
			AgentKind::QualityChecker => Provider::Anthropic,
			AgentKind::CitationFormatter => Provider::Openai,
			AgentKind::MetadataEnhancer => Provider::Perplexity,
			AgentKind::ResearchAgent => Provider::Perplexity,
		}
	}
}

impl std::fmt::Display for AgentKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			AgentKind::PaperProcessor => "PAPER_PROCESSOR",
			AgentKind::ContentSummariser => "CONTENT_SUMMARISER",
			AgentKind::QualityChecker => "QUALITY_CHECKER",
			AgentKind::CitationFormatter => "CITATION_FORMATTER",
			AgentKind::MetadataEnhancer => "METADATA_ENHANCER",
			AgentKind::ResearchAgent => "RESEARCH_AGENT",
		};
		write!(f, "{s}")
	}
}
