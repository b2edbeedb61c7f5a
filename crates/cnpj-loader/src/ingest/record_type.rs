//! Record types published in the CNPJ open-data release
//!
//! Each release ships one kind of record per file. The kind is recognised
//! from a fixed marker in the file name (for example `...D40511.EMPRECSV`),
//! and it determines the positional column names, the columns that need
//! value fixes, and the destination table.

use crate::error::{IngestError, IngestResult};
use cnpj_common::DatasetVersion;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

const REFERENCE_COLUMNS: &[&str] = &["codigo", "descricao"];

const EMPRESA_COLUMNS: &[&str] = &[
    "cnpj_basico",
    "razao_social",
    "natureza_juridica",
    "qualificacao_responsavel",
    "capital_social",
    "porte",
    "ente_federativo_responsavel",
];

const ESTABELECIMENTO_COLUMNS: &[&str] = &[
    "cnpj_basico",
    "cnpj_ordem",
    "cnpj_dv",
    "identificador_matriz_filial",
    "nome_fantasia",
    "situacao_cadastral",
    "data_situacao_cadastral",
    "motivo_situacao_cadastral",
    "nome_cidade_exterior",
    "pais",
    "data_inicio_atividade",
    "cnae_fiscal_principal",
    "cnae_fiscal_secundaria",
    "tipo_logradouro",
    "logradouro",
    "numero",
    "complemento",
    "bairro",
    "cep",
    "uf",
    "municipio",
    "ddd_1",
    "telefone_1",
    "ddd_2",
    "telefone_2",
    "ddd_fax",
    "fax",
    "correio_eletronico",
    "situacao_especial",
    "data_situacao_especial",
];

const SOCIO_COLUMNS: &[&str] = &[
    "cnpj_basico",
    "identificador_de_socio",
    "nome_socio",
    "cnpj_cpf_do_socio",
    "qualificacao_do_socio",
    "data_entrada_sociedade",
    "pais",
    "representante_legal",
    "nome_do_representante",
    "qualificacao_do_representante_legal",
    "faixa_etaria",
];

const SIMPLES_COLUMNS: &[&str] = &[
    "cnpj_basico",
    "opcao_pelo_simples",
    "data_opcao_pelo_simples",
    "data_exclusao_do_simples",
    "opcao_pelo_mei",
    "data_opcao_pelo_mei",
    "data_exclusao_do_mei",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Cnae,
    Motivo,
    Municipio,
    NaturezaJuridica,
    Pais,
    QualificacaoSocio,
    Empresa,
    Estabelecimento,
    Socio,
    Simples,
}

impl RecordType {
    pub const ALL: [RecordType; 10] = [
        RecordType::Cnae,
        RecordType::Motivo,
        RecordType::Municipio,
        RecordType::NaturezaJuridica,
        RecordType::Pais,
        RecordType::QualificacaoSocio,
        RecordType::Empresa,
        RecordType::Estabelecimento,
        RecordType::Socio,
        RecordType::Simples,
    ];

    /// Marker searched for in the upper-cased file name.
    pub fn pattern(self) -> &'static str {
        match self {
            RecordType::Cnae => "CNAECSV",
            RecordType::Motivo => "MOTICSV",
            RecordType::Municipio => "MUNICCSV",
            RecordType::NaturezaJuridica => "NATJUCSV",
            RecordType::Pais => "PAISCSV",
            RecordType::QualificacaoSocio => "QUALSCSV",
            RecordType::Empresa => "EMPRECSV",
            RecordType::Estabelecimento => "ESTABELE",
            RecordType::Socio => "SOCIOCSV",
            RecordType::Simples => "SIMPLESCSV",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            RecordType::Cnae => "cnaes",
            RecordType::Motivo => "motivos",
            RecordType::Municipio => "municipios",
            RecordType::NaturezaJuridica => "naturezas_juridicas",
            RecordType::Pais => "paises",
            RecordType::QualificacaoSocio => "qualificacoes_socios",
            RecordType::Empresa => "empresas",
            RecordType::Estabelecimento => "estabelecimentos",
            RecordType::Socio => "socios",
            RecordType::Simples => "dados_simples",
        }
    }

    /// Semantic names by position.
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            RecordType::Empresa => EMPRESA_COLUMNS,
            RecordType::Estabelecimento => ESTABELECIMENTO_COLUMNS,
            RecordType::Socio => SOCIO_COLUMNS,
            RecordType::Simples => SIMPLES_COLUMNS,
            _ => REFERENCE_COLUMNS,
        }
    }

    /// Columns published with a decimal comma.
    pub fn numeric_columns(self) -> &'static [&'static str] {
        match self {
            RecordType::Empresa => &["capital_social"],
            _ => &[],
        }
    }

    /// Columns that use `"0"` to mean "no date".
    pub fn date_columns(self) -> &'static [&'static str] {
        match self {
            RecordType::Estabelecimento => &[
                "data_situacao_cadastral",
                "data_inicio_atividade",
                "data_situacao_especial",
            ],
            RecordType::Socio => &["data_entrada_sociedade"],
            RecordType::Simples => &[
                "data_opcao_pelo_simples",
                "data_exclusao_do_simples",
                "data_opcao_pelo_mei",
                "data_exclusao_do_mei",
            ],
            _ => &[],
        }
    }

    pub fn is_reference(self) -> bool {
        self.dependency_rank() == 0
    }

    /// Case-insensitive marker match on a file name.
    pub fn detect(filename: &str) -> Option<Self> {
        let upper = filename.to_uppercase();
        Self::ALL.into_iter().find(|kind| upper.contains(kind.pattern()))
    }

    /// Load order: lookup tables first so the large tables can reference them.
    fn dependency_rank(self) -> u8 {
        match self {
            RecordType::Empresa => 1,
            RecordType::Estabelecimento => 2,
            RecordType::Socio => 3,
            RecordType::Simples => 4,
            _ => 0,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pattern())
    }
}

/// A decompressed file of one dataset version, classified by record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub filename: String,
    pub version: DatasetVersion,
    pub record_type: RecordType,
}

impl SourceFile {
    pub fn resolve(path: &Path, version: &DatasetVersion) -> IngestResult<Self> {
        let filename = file_name(path);
        let record_type = RecordType::detect(&filename).ok_or_else(|| {
            IngestError::UnrecognizedFileType {
                filename: filename.clone(),
            }
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            filename,
            version: version.clone(),
            record_type,
        })
    }
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Order files so that lookup tables load before the tables that refer to
/// them. Unrecognised files go last; each group is sorted by name.
pub fn order_by_dependency(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort_by_cached_key(|path| {
        let name = file_name(path);
        let rank = RecordType::detect(&name).map_or(u8::MAX, RecordType::dependency_rank);
        (rank, name)
    });
    paths
}
