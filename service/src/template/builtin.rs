use domain::model::vo::BackendKind;

const SLURM: &str = r#"#!/bin/bash
#
#SBATCH --job-name={{job_name}}
{{?queue}}#SBATCH --partition={{queue}}
#SBATCH --ntasks=1
#SBATCH --cpus-per-task={{cores}}
{{?gpus}}#SBATCH --gres=gpu:{{gpus}}
{{?memory_mb}}#SBATCH --mem={{memory_mb}}M
{{?walltime}}#SBATCH --time={{walltime}}
#SBATCH --chdir="{{workdir}}"
{{?output}}#SBATCH --output="{{output}}"
{{?error}}#SBATCH --error="{{error}}"
{{?envvars}}#SBATCH --export={{envvars}}

trap "touch '{{workdir}}/{{sentinel}}'" EXIT SIGTERM

{{prerun}}
{{environment}}

cd "{{workdir}}"
{{commands}}
"#;

const PBS: &str = r#"#!/bin/bash
#
#PBS -N {{job_name}}
{{?queue}}#PBS -q {{queue}}
#PBS -l select={{pbs_select}}
{{?gpus}}#PBS -l ngpus={{gpus}}
{{?memory_mb}}#PBS -l mem={{memory_mb}}MB
{{?walltime}}#PBS -l walltime={{walltime}}
{{?output}}#PBS -o "{{output}}"
{{?error}}#PBS -e "{{error}}"
{{?envvars}}#PBS -v {{envvars}}

trap "touch '{{workdir}}/{{sentinel}}'" EXIT SIGTERM

{{prerun}}
{{environment}}

cd "{{workdir}}"
{{commands}}
"#;

const LSF: &str = r#"#!/bin/bash
#
#BSUB -J {{job_name}}
{{?queue}}#BSUB -q "{{queue}}"
#BSUB -n {{cores}}
{{?app}}#BSUB -app {{app}}
{{?gpus}}#BSUB -gpu "num={{gpus}}"
{{lsf_resources}}
{{?memory_mb}}#BSUB -M {{memory_mb}}
#BSUB -cwd "{{workdir}}"
#BSUB -outdir "{{workdir}}"
{{?output}}#BSUB -o "{{output}}"
{{?error}}#BSUB -e "{{error}}"
{{?envvars}}#BSUB --env {{envvars}}
{{?walltime_minutes}}#BSUB -W {{walltime_minutes}}

trap "touch '{{workdir}}/{{sentinel}}'" EXIT SIGTERM

{{prerun}}
{{environment}}

cd "{{workdir}}"
{{commands}}
"#;

const LOCAL: &str = r#"#!/bin/bash

trap "touch '{{workdir}}/{{sentinel}}'" EXIT SIGTERM

{{prerun}}
{{environment}}

cd "{{workdir}}"
{{commands}}
"#;

pub(super) fn source(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Slurm => SLURM,
        BackendKind::Pbs => PBS,
        BackendKind::Lsf => LSF,
        BackendKind::Local => LOCAL,
    }
}
